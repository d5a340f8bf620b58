//! The emulated disk: a CP/M 2.2 directory and sector surface over a host
//! directory.
//!
//! Directory entries are synthesised on demand from the host files found
//! at construction time; data sectors are read through to the owning host
//! file and cached. Writes only touch the cache until flush, which runs on
//! shutdown: modified files are rewritten, deletions are applied, and any
//! remaining dirty data sectors are patched into their owners.
//!
//! Tracks 0 and 1 hold the directory; blocks are 2 KiB (16 sectors of 128
//! bytes) and data blocks are numbered from 0x10 upwards.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{trace, warn};

pub const SECTOR_SIZE: usize = 128;
pub const BLOCK_SIZE: usize = 2048;
pub const SECTORS_PER_BLOCK: u16 = (BLOCK_SIZE / SECTOR_SIZE) as u16;
pub const ENTRY_SIZE: usize = 32;

/// Block shift factor: sector count within a block fits in BSH bits.
pub const BSH: u8 = 4;
/// Data allocation block mask.
pub const BLM: u8 = 0x0F;

/// Sectors per track; tracks 0 and 1 are directory space.
const SECTORS_PER_TRACK: u16 = 128;
/// An extent covers 16 KiB: 128 sectors, one directory entry.
const EXTENT_BYTES: u64 = 0x80 * SECTOR_SIZE as u64;
/// First block number available for file data (the directory occupies the
/// blocks below).
const FIRST_DATA_BLOCK: u16 = 0x10;

pub type SectorData = [u8; SECTOR_SIZE];

type Location = (u16, u16);

/// One CP/M directory entry. A file bigger than one extent has several.
#[derive(Debug, Clone)]
struct Entry {
    /// Host filename, e.g. "file.txt".
    raw_name: String,
    /// 11-character upper-case CP/M rendering, e.g. "FILE    TXT".
    name: String,
    /// False once the guest has deleted the file.
    exists: bool,
    /// Size in bytes of the whole file.
    size: u64,
    /// Sectors covered by this extent (at most 128).
    sectors: u16,
    /// Extent ordinal; zero for small files.
    extent: u16,
    /// First block of the whole file, across all its extents.
    first_block: u16,
    /// Blocks allocated to this extent, always contiguous.
    blocks: Vec<u16>,
    /// Needs flushing to the host filesystem on shutdown.
    modified: bool,
}

impl Entry {
    fn from_host(raw_name: &str, size: u64, extent: u16, sectors: u16, first_block: u16) -> Self {
        Self {
            raw_name: raw_name.to_string(),
            name: cpm_name(raw_name),
            exists: true,
            size,
            sectors: sectors.min(0x80),
            extent,
            first_block,
            blocks: Vec::new(),
            modified: false,
        }
    }

    /// Build from a raw 32-byte directory entry the guest BDOS wrote.
    /// Such an entry always needs flushing, it has no host counterpart yet.
    fn from_raw(buffer: &[u8]) -> Self {
        let name: String = buffer[1..12].iter().map(|&b| (b & 0x7F) as char).collect();
        let raw_name = format!(
            "{}.{}",
            name[..8].trim_end().to_lowercase(),
            name[8..].trim_end().to_lowercase()
        );
        let mut blocks = Vec::new();
        for i in 0..8 {
            let block = u16::from_le_bytes([buffer[0x10 + i * 2], buffer[0x10 + i * 2 + 1]]);
            if block > 0 {
                blocks.push(block);
            }
        }
        Self {
            raw_name,
            name,
            exists: buffer[0] != 0xE5,
            size: 0,
            sectors: buffer[0x0F] as u16,
            extent: buffer[0x0C] as u16 | ((buffer[0x0E] as u16) << 5),
            first_block: 0,
            blocks,
            modified: true,
        }
    }

    fn log_details(&self) {
        trace!(
            "  '{}' '{}' Size={} Sectors={} Extent={} FirstBlock={} {:?} Exists:{}",
            self.raw_name,
            self.name,
            self.size,
            self.sectors,
            self.extent,
            self.first_block,
            self.blocks,
            if self.exists { 'Y' } else { 'N' }
        );
    }
}

struct SectorInfo {
    data: SectorData,
    dirty: bool,
}

pub struct Disk {
    root: PathBuf,
    entries: Vec<Entry>,
    cache: BTreeMap<Location, SectorInfo>,
    next_block: u16,
}

/// Convert e.g. `foo.txt` to `FOO     TXT`.
fn cpm_name(filename: &str) -> String {
    let (stem, extension) = match filename.rfind('.') {
        Some(dot) => (&filename[..dot], &filename[dot + 1..]),
        None => (filename, ""),
    };
    let stem: String = stem.to_uppercase().chars().take(8).collect();
    let extension: String = extension.to_uppercase().chars().take(3).collect();
    format!("{:<8}{:<3}", stem, extension)
}

/// Track/sector of the `offset`-th sector within `block`.
fn location_within_block(block: u16, offset: u16) -> Location {
    let s = block * SECTORS_PER_BLOCK + offset;
    (s / SECTORS_PER_TRACK, s % SECTORS_PER_TRACK)
}

/// Block number and sector offset within it for a track/sector.
fn block_and_offset(track: u16, sector: u16) -> (u16, u16) {
    let n = track * SECTORS_PER_TRACK + sector;
    (n >> BSH, n & BLM as u16)
}

impl Disk {
    /// Scan `root` (non-recursively) and build the directory. The named
    /// log-sink file is excluded, it belongs to the emulator itself.
    pub fn new(root: impl AsRef<Path>, excluded_log: &str) -> Self {
        let mut disk = Self {
            root: root.as_ref().to_path_buf(),
            entries: Vec::new(),
            cache: BTreeMap::new(),
            next_block: FIRST_DATA_BLOCK,
        };
        disk.build_directory(excluded_log);
        disk
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn build_directory(&mut self, excluded_log: &str) {
        let mut names = Vec::new();
        match std::fs::read_dir(&self.root) {
            Ok(iter) => {
                for item in iter.flatten() {
                    let path = item.path();
                    if !path.is_file() {
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name == excluded_log {
                        continue;
                    }
                    let size = item.metadata().map(|m| m.len()).unwrap_or(0);
                    names.push((name.to_string(), size));
                }
            }
            Err(e) => {
                warn!("Can't scan '{}': {}", self.root.display(), e);
                return;
            }
        }
        // Host directory iteration order is arbitrary; sort so the block
        // layout is stable from run to run.
        names.sort();

        for (name, bytes) in names {
            let num_entries = bytes.div_ceil(EXTENT_BYTES);
            let first_block = self.next_block;
            let mut remaining_sectors = bytes.div_ceil(SECTOR_SIZE as u64) as u16;
            for i in 0..num_entries {
                let mut entry =
                    Entry::from_host(&name, bytes, i as u16, remaining_sectors, first_block);
                let blocks_this_entry = entry.sectors.div_ceil(SECTORS_PER_BLOCK);
                for _ in 0..blocks_this_entry {
                    entry.blocks.push(self.next_block);
                    self.next_block += 1;
                }
                remaining_sectors -= entry.sectors;
                self.entries.push(entry);
            }
        }

        trace!("{} directory entries:", self.entries.len());
        for entry in &self.entries {
            entry.log_details();
        }
    }

    /// Read the 128-byte sector at (track, sector) into `buffer`.
    pub fn read(&mut self, buffer: &mut SectorData, track: u16, sector: u16) {
        let location = (track, sector);
        if let Some(info) = self.cache.get(&location) {
            buffer.copy_from_slice(&info.data);
            return;
        }

        if track <= 1 {
            self.create_directory_entries(buffer, track, sector);
        } else {
            self.read_disk_data(buffer, track, sector);
        }

        // CP/M disks are small, the whole thing fits in memory.
        self.cache.insert(
            location,
            SectorInfo {
                data: *buffer,
                dirty: false,
            },
        );
    }

    /// Write the 128-byte sector at (track, sector) from `buffer`.
    pub fn write(&mut self, buffer: &SectorData, track: u16, sector: u16) {
        if track <= 1 {
            // The guest BDOS is rewriting directory state; reconcile it
            // against our entry list.
            self.check_for_directory_changes(buffer);
        }

        match self.cache.get_mut(&(track, sector)) {
            Some(info) => {
                info.data = *buffer;
                info.dirty = true;
            }
            None => {
                self.cache.insert(
                    (track, sector),
                    SectorInfo {
                        data: *buffer,
                        dirty: true,
                    },
                );
            }
        }
    }

    /// Synthesise the four directory entries this sector covers.
    fn create_directory_entries(&self, buffer: &mut SectorData, track: u16, sector: u16) {
        let index = (track * SECTORS_PER_TRACK + sector) as usize * 4;
        for i in 0..SECTOR_SIZE / ENTRY_SIZE {
            self.format_directory_entry(
                &mut buffer[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE],
                index + i,
            );
        }
    }

    /// Format the n-th directory entry into `slot`; positions past the
    /// live list are rendered inactive.
    fn format_directory_entry(&self, slot: &mut [u8], n: usize) {
        let Some(entry) = self.entries.get(n) else {
            slot.fill(0xE5);
            return;
        };

        slot.fill(0);

        // Byte 0: user code, or E5 for inactive/deleted. Only user 0 is
        // presented.
        slot[0] = if entry.exists { 0x00 } else { 0xE5 };

        for (i, ch) in entry.name.bytes().enumerate() {
            slot[1 + i] = ch;
        }

        slot[0x0C] = (entry.extent & 0x1F) as u8;
        slot[0x0D] = 0x00;
        slot[0x0E] = ((entry.extent >> 5) & 0xFF) as u8;
        slot[0x0F] = entry.sectors as u8;

        for (i, &block) in entry.blocks.iter().enumerate() {
            slot[0x10 + i * 2] = block as u8;
            slot[0x10 + i * 2 + 1] = (block >> 8) as u8;
        }
    }

    /// Work out which host file owns the block behind (track, sector) and
    /// read the matching 128 bytes out of it. On failure the buffer keeps
    /// whatever it held.
    fn read_disk_data(&self, buffer: &mut SectorData, track: u16, sector: u16) {
        let (block, offset) = block_and_offset(track, sector);

        for entry in &self.entries {
            if !entry.blocks.contains(&block) {
                continue;
            }
            // The chunk index is relative to the first block of the whole
            // file, not of this extent.
            let chunk = ((block - entry.first_block) << BSH) as u64 + offset as u64;
            let path = self.root.join(&entry.raw_name);
            match File::open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file
                        .seek(SeekFrom::Start(chunk * SECTOR_SIZE as u64))
                        .and_then(|_| file.read(buffer.as_mut_slice()))
                    {
                        warn!("Read of chunk #{} from '{}' failed: {}", chunk, entry.raw_name, e);
                    } else {
                        trace!("Reading chunk #{} from {}", chunk, entry.raw_name);
                    }
                }
                Err(e) => {
                    warn!("Can't open '{}': {}", path.display(), e);
                }
            }
            return;
        }

        warn!(
            "Can't find file for TRACK:{:04X} SECTOR:{:04X}",
            track, sector
        );
    }

    /// Compare the four pending entries in a freshly written directory
    /// sector against the live list and apply what changed.
    fn check_for_directory_changes(&mut self, buffer: &SectorData) {
        for i in 0..SECTOR_SIZE / ENTRY_SIZE {
            let pending = Entry::from_raw(&buffer[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
            if pending.exists {
                trace!("Considering pending entry:");
                pending.log_details();

                let mut found = false;
                for entry in &mut self.entries {
                    if !entry.exists {
                        // A dead slot never matches; re-creating the same
                        // name appends a fresh entry instead.
                        continue;
                    }
                    if entry.name == pending.name
                        && entry.extent == pending.extent
                        && entry.blocks == pending.blocks
                    {
                        trace!("  (no action required)");
                        found = true;
                    } else if entry.name == pending.name && entry.extent == pending.extent {
                        trace!("  (content modification)");
                        entry.sectors = pending.sectors;
                        entry.blocks = pending.blocks.clone();
                        entry.size = entry.sectors as u64 * SECTOR_SIZE as u64;
                        // The abandoned blocks are not reclaimed; the
                        // counter only ever moves forward.
                        entry.first_block = self.next_block;
                        self.next_block += 1;
                        entry.modified = true;
                        found = true;
                    } else if entry.name != pending.name
                        && entry.extent == pending.extent
                        && entry.blocks == pending.blocks
                        && !pending.blocks.is_empty()
                    {
                        trace!("  (rename of '{}' to '{}')", entry.raw_name, pending.raw_name);
                        entry.name = pending.name.clone();
                        entry.raw_name = pending.raw_name.clone();
                        entry.modified = true;
                        found = true;
                    }
                    if found {
                        break;
                    }
                }

                if !found {
                    trace!("  (file creation)");
                    self.entries.push(pending);
                }
            } else {
                for entry in &mut self.entries {
                    if entry.name == pending.name
                        && entry.exists
                        && entry.extent == pending.extent
                        && entry.blocks == pending.blocks
                    {
                        trace!("  (deletion):");
                        pending.log_details();
                        entry.exists = false;
                        entry.modified = true;
                        break;
                    }
                }
            }
        }
    }

    /// Write back everything the guest changed: directory-level changes
    /// first, then any remaining dirty data sectors. Host I/O failures are
    /// logged and do not stop the rest of the flush.
    pub fn flush(&mut self) {
        self.flush_file_changes();
        self.flush_changed_sectors();
    }

    fn flush_file_changes(&mut self) {
        for index in 0..self.entries.len() {
            if !self.entries[index].modified {
                continue;
            }
            self.entries[index].modified = false;

            trace!("Flush '{}' to host filesystem:", self.entries[index].raw_name);
            self.entries[index].log_details();

            if self.entries[index].exists {
                self.flush_entry_to_file(index);
            } else {
                // A deleted entry erases the host file, unless a live
                // entry with the same name was created in this session.
                let raw_name = self.entries[index].raw_name.clone();
                let has_existing_version = self
                    .entries
                    .iter()
                    .any(|e| e.exists && e.raw_name == raw_name);
                if has_existing_version {
                    trace!("(not erasing because an existing one is still present)");
                } else {
                    trace!("(erasing it if it still exists)");
                    let _ = std::fs::remove_file(self.root.join(&raw_name));
                }
            }
        }
    }

    fn flush_entry_to_file(&mut self, index: usize) {
        let path = self.root.join(&self.entries[index].raw_name);
        let mut file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Can't create '{}': {}", path.display(), e);
                return;
            }
        };

        let blocks = self.entries[index].blocks.clone();
        let mut sectors_remaining = self.entries[index].sectors;
        for block in blocks {
            let sectors_this_block = SECTORS_PER_BLOCK.min(sectors_remaining);
            trace!("Writing {} sectors from block #{}", sectors_this_block, block);
            for i in 0..sectors_this_block {
                let location = location_within_block(block, i);
                match self.cache.get_mut(&location) {
                    Some(info) => {
                        if let Err(e) = file.write_all(&info.data) {
                            warn!("Write to '{}' failed: {}", path.display(), e);
                        }
                        info.dirty = false;
                    }
                    None => {
                        warn!(
                            "No cached data for TRACK:{:04X} SECTOR:{:04X} of '{}'",
                            location.0, location.1, path.display()
                        );
                    }
                }
            }
            sectors_remaining -= sectors_this_block;
        }
    }

    /// Residual dirty sectors are in-place modifications of existing
    /// files, typically from random-access writes.
    fn flush_changed_sectors(&mut self) {
        let mut pending = Vec::new();
        for (&(track, sector), info) in self.cache.iter() {
            if info.dirty && track > 1 {
                pending.push((track, sector));
            }
        }

        for (track, sector) in pending {
            let (block, offset) = block_and_offset(track, sector);
            let owner = self.entries.iter().find(|e| {
                e.exists && e.blocks.contains(&block)
            });
            let Some(entry) = owner else {
                continue;
            };

            trace!(
                "Sector {:02X}:{:02X} is block {} offset {} within file {}",
                track,
                sector,
                block,
                offset,
                entry.raw_name
            );

            let byte_offset =
                (((block - entry.first_block) << BSH) as u64 + offset as u64) * SECTOR_SIZE as u64;
            let path = self.root.join(&entry.raw_name);
            let Some(info) = self.cache.get_mut(&(track, sector)) else {
                continue;
            };
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file
                        .seek(SeekFrom::Start(byte_offset))
                        .and_then(|_| file.write_all(&info.data))
                    {
                        warn!("Write to '{}' failed: {}", path.display(), e);
                    } else {
                        info.dirty = false;
                    }
                }
                Err(e) => {
                    warn!("Can't open '{}': {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDir {
        path: PathBuf,
    }

    impl TestDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "cpm80-disk-{}-{}",
                tag,
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&path);
            std::fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn write_file(&self, name: &str, contents: &[u8]) {
            std::fs::write(self.path.join(name), contents).unwrap();
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn test_cpm_name_conversion() {
        assert_eq!(cpm_name("foo.txt"), "FOO     TXT");
        assert_eq!(cpm_name("verylongname.extension"), "VERYLONG EXT");
        assert_eq!(cpm_name("noext"), "NOEXT      ");
        assert_eq!(cpm_name("a.b"), "A       B  ");
    }

    #[test]
    fn test_geometry_mapping() {
        assert_eq!(block_and_offset(0, 0), (0, 0));
        assert_eq!(block_and_offset(0, 16), (1, 0));
        assert_eq!(block_and_offset(2, 0), (16, 0));
        assert_eq!(block_and_offset(2, 17), (17, 1));
        assert_eq!(location_within_block(16, 0), (2, 0));
        assert_eq!(location_within_block(17, 1), (2, 17));
        // Round trip across a spread of sectors.
        for track in [2u16, 3, 9] {
            for sector in [0u16, 1, 15, 16, 127] {
                let (block, offset) = block_and_offset(track, sector);
                assert_eq!(location_within_block(block, offset), (track, sector));
            }
        }
    }

    #[test]
    fn test_directory_build_extents_and_blocks() {
        let dir = TestDir::new("build");
        dir.write_file("small.txt", &[0x41; 300]);
        dir.write_file("big.bin", &[0x42; 40_000]);
        let disk = Disk::new(&dir.path, "zcpm.log");

        // big.bin: ceil(40000/16384) = 3 extents; small.txt: 1.
        assert_eq!(disk.entry_count(), 4);

        // Entries are sorted by host name, so big.bin comes first.
        let big: Vec<_> = disk.entries.iter().filter(|e| e.raw_name == "big.bin").collect();
        assert_eq!(big.len(), 3);
        assert_eq!(big[0].sectors, 128);
        assert_eq!(big[1].sectors, 128);
        assert_eq!(big[2].sectors, 57); // ceil(40000/128) - 256
        let total_blocks: usize = big.iter().map(|e| e.blocks.len()).sum();
        assert_eq!(total_blocks, 20); // ceil(40000/2048)
        assert!(big.iter().all(|e| e.first_block == big[0].first_block));

        let small = disk
            .entries
            .iter()
            .find(|e| e.raw_name == "small.txt")
            .unwrap();
        assert_eq!(small.sectors, 3);
        assert_eq!(small.blocks.len(), 1);

        // Block allocation starts at 0x10 and never overlaps.
        let mut all_blocks: Vec<u16> = disk
            .entries
            .iter()
            .flat_map(|e| e.blocks.iter().copied())
            .collect();
        all_blocks.sort();
        assert_eq!(all_blocks[0], FIRST_DATA_BLOCK);
        let mut deduped = all_blocks.clone();
        deduped.dedup();
        assert_eq!(all_blocks, deduped);
    }

    #[test]
    fn test_log_file_is_excluded() {
        let dir = TestDir::new("exclude");
        dir.write_file("zcpm.log", b"log noise");
        dir.write_file("real.txt", b"data");
        let disk = Disk::new(&dir.path, "zcpm.log");
        assert_eq!(disk.entry_count(), 1);
        assert_eq!(disk.entries[0].raw_name, "real.txt");
    }

    #[test]
    fn test_data_sector_round_trip() {
        let dir = TestDir::new("roundtrip");
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = i as u8 ^ 0x5A;
        }
        disk.write(&pattern, 2, 0);

        let mut readback = [0u8; SECTOR_SIZE];
        disk.read(&mut readback, 2, 0);
        assert_eq!(readback, pattern);
    }

    #[test]
    fn test_directory_sector_synthesis() {
        let dir = TestDir::new("dirsec");
        dir.write_file("hello.txt", &[0x41; 200]); // 2 sectors, 1 block
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read(&mut sector, 0, 0);

        assert_eq!(sector[0], 0x00);
        assert_eq!(&sector[1..12], b"HELLO   TXT");
        assert_eq!(sector[0x0C], 0); // extent
        assert_eq!(sector[0x0F], 2); // record count
        assert_eq!(
            u16::from_le_bytes([sector[0x10], sector[0x11]]),
            FIRST_DATA_BLOCK
        );
        // Slots past the live list are inactive.
        assert!(sector[ENTRY_SIZE..].iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn test_reading_host_file_data() {
        let dir = TestDir::new("readdata");
        let mut contents = vec![0u8; 300];
        for (i, byte) in contents.iter_mut().enumerate() {
            *byte = i as u8;
        }
        dir.write_file("data.bin", &contents);
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        // Block 0x10 is the file's first block: track 2, sector 0.
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read(&mut sector, 2, 0);
        assert_eq!(&sector[..], &contents[..SECTOR_SIZE]);

        disk.read(&mut sector, 2, 1);
        assert_eq!(&sector[..], &contents[SECTOR_SIZE..2 * SECTOR_SIZE]);

        // The tail sector is short; the rest of the buffer keeps its
        // previous contents.
        let mut sector = [0xEEu8; SECTOR_SIZE];
        disk.read(&mut sector, 2, 2);
        assert_eq!(&sector[..44], &contents[256..]);
    }

    #[test]
    fn test_file_creation_via_directory_write() {
        let dir = TestDir::new("create");
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        // Write a data sector for block 0x10, then a directory entry that
        // claims it.
        let data = [0x33u8; SECTOR_SIZE];
        disk.write(&data, 2, 0);

        let mut dirsec = [0xE5u8; SECTOR_SIZE];
        dirsec[..ENTRY_SIZE].fill(0);
        dirsec[0] = 0x00;
        dirsec[1..12].copy_from_slice(b"NEW     TXT");
        dirsec[0x0F] = 1; // one record
        dirsec[0x10] = 0x10; // block 0x10
        disk.write(&dirsec, 0, 0);

        assert_eq!(disk.entry_count(), 1);
        assert!(disk.entries[0].exists);
        assert_eq!(disk.entries[0].raw_name, "new.txt");

        disk.flush();
        let written = std::fs::read(dir.path.join("new.txt")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn test_file_deletion_via_directory_write() {
        let dir = TestDir::new("delete");
        dir.write_file("doomed.txt", &[0x41; 100]);
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        // Fetch the live entry, then write it back with the inactive
        // marker.
        let mut dirsec = [0u8; SECTOR_SIZE];
        disk.read(&mut dirsec, 0, 0);
        dirsec[0] = 0xE5;
        disk.write(&dirsec, 0, 0);

        assert!(!disk.entries[0].exists);
        disk.flush();
        assert!(!dir.path.join("doomed.txt").exists());
    }

    #[test]
    fn test_rename_via_directory_write() {
        let dir = TestDir::new("rename");
        dir.write_file("old.txt", &[0x41; 100]);
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        let mut dirsec = [0u8; SECTOR_SIZE];
        disk.read(&mut dirsec, 0, 0);
        dirsec[1..12].copy_from_slice(b"NEW     TXT");
        disk.write(&dirsec, 0, 0);

        assert!(disk.entries[0].exists);
        assert_eq!(disk.entries[0].raw_name, "new.txt");
        assert_eq!(disk.entries[0].name, "NEW     TXT");
    }

    #[test]
    fn test_rewrite_advances_block_counter() {
        // A content modification abandons the old first_block and takes a
        // fresh allocation; block numbers are never reused.
        let dir = TestDir::new("leak");
        dir.write_file("file.txt", &[0x41; 100]);
        let mut disk = Disk::new(&dir.path, "zcpm.log");
        let counter_before = disk.next_block;

        let mut dirsec = [0u8; SECTOR_SIZE];
        disk.read(&mut dirsec, 0, 0);
        dirsec[0x10] = 0x42; // a different block list
        disk.write(&dirsec, 0, 0);

        assert!(disk.next_block > counter_before);
        assert_eq!(disk.entries[0].first_block, counter_before);
        assert_eq!(disk.entries[0].blocks, vec![0x42]);
    }

    #[test]
    fn test_deletion_skipped_when_replaced_in_session() {
        let dir = TestDir::new("replace");
        dir.write_file("keep.txt", &[0x41; 100]);
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        // Delete, then create a fresh entry with the same name.
        let mut dirsec = [0u8; SECTOR_SIZE];
        disk.read(&mut dirsec, 0, 0);
        let original = dirsec;
        dirsec[0] = 0xE5;
        disk.write(&dirsec, 0, 0);

        let mut fresh = original;
        fresh[0x10] = 0x40; // new data lives elsewhere
        disk.write(&fresh, 0, 0);
        let data = [0x99u8; SECTOR_SIZE];
        let (track, sector) = location_within_block(0x40, 0);
        disk.write(&data, track, sector);

        disk.flush();
        // The host file must survive, rewritten with the new contents.
        let written = std::fs::read(dir.path.join("keep.txt")).unwrap();
        assert_eq!(written[0], 0x99);
    }

    #[test]
    fn test_dirty_sector_patches_existing_file() {
        let dir = TestDir::new("patch");
        dir.write_file("patched.bin", &vec![0u8; 4 * SECTOR_SIZE]);
        let mut disk = Disk::new(&dir.path, "zcpm.log");

        // Overwrite the third sector in place (track 2, sector 2).
        let patch = [0x77u8; SECTOR_SIZE];
        disk.write(&patch, 2, 2);
        disk.flush();

        let contents = std::fs::read(dir.path.join("patched.bin")).unwrap();
        assert_eq!(&contents[..SECTOR_SIZE], &vec![0u8; SECTOR_SIZE][..]);
        assert_eq!(
            &contents[2 * SECTOR_SIZE..3 * SECTOR_SIZE],
            &patch[..]
        );
    }
}
