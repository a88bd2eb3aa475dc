use crate::block_device::BlockDevice;
use crate::image::attributes::attribute_flags_text;
use crate::image::fat::{Fat, FatType};
use crate::image::image::{VvfatImage, VVFAT_ATTR};
use crate::image::mapping::{find_mapping_for_cluster, find_mapping_for_path};
use crate::image::on_disk::direntry::{DirEntry, ATTR_DIRECTORY};
use crate::time::system_time_from_fat;
use crate::{ByteSerializable, VvfatError};
use std::fs::{File, FileTimes, OpenOptions};
use std::io::{SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// One resolved entry of a guest directory: the 8.3 record plus the long
/// name accumulated from the preceding LFN chain (or the decoded short name
/// when no chain was present).
struct GuestEntry {
    entry: DirEntry,
    filename: String,
}

/// Walks the raw bytes of a guest directory, resolving long-name chains and
/// skipping free, deleted, dot and volume-label records.
fn decode_directory(buffer: &[u8]) -> Vec<GuestEntry> {
    let mut result = Vec::new();
    let mut long_name = String::new();
    let mut has_long_name = false;

    let mut offset = 0;
    while offset + 32 <= buffer.len() {
        let entry = match DirEntry::from_bytes(&buffer[offset..]) {
            Some(e) => e,
            None => break,
        };
        offset += 32;

        if entry.is_free() {
            break;
        }
        if (entry.name[0] == b'.')
            || entry.is_deleted()
            || (!entry.is_long_name() && entry.is_volume_label())
        {
            continue;
        }

        if entry.is_long_name() {
            let mut fragment = String::new();
            for &b in entry.lfn_fragment().iter() {
                if (b == 0) || (b == 0xff) {
                    break;
                }
                fragment.push(b as char);
            }
            // chains are stored most significant segment first
            long_name = fragment + &long_name;
            has_long_name = true;
        } else {
            let filename = if has_long_name {
                long_name.clone()
            } else {
                entry.decoded_short_name()
            };
            result.push(GuestEntry { entry, filename });
            long_name.clear();
            has_long_name = false;
        }
    }

    return result;
}

fn file_changed(guest: &DirEntry, original: &DirEntry) -> bool {
    return (guest.mdate != original.mdate)
        || (guest.mtime != original.mtime)
        || (guest.size != original.size);
}

impl VvfatImage {
    /// Reads the guest's view of a directory: the fixed root region, or a
    /// cluster chain followed through the committed FAT.
    fn load_guest_directory(
        &mut self,
        start_cluster: u32,
        fat2: &Fat,
    ) -> Result<Vec<u8>, VvfatError> {
        let csize = self.cluster_size as usize;
        let rsvd_clusters = self.max_fat_value - 15;

        if start_cluster == 0 {
            let size = (self.root_entries as usize) * 32;
            let mut buffer = vec![0u8; size];
            self.seek(SeekFrom::Start((self.offset_to_root_dir as u64) * 512))?;
            self.read(&mut buffer)?;

            return Ok(buffer);
        }

        let mut buffer = Vec::new();
        let mut next = start_cluster;
        let mut followed = 0u32;

        loop {
            let cur = next;
            if cur < 2 {
                break;
            }

            let mut chunk = vec![0u8; csize];
            self.seek(SeekFrom::Start(self.cluster_to_sector(cur) * 512))?;
            self.read(&mut chunk)?;
            buffer.extend_from_slice(&chunk);

            next = fat2.get(cur);
            if next >= rsvd_clusters {
                break;
            }

            followed += 1;
            if followed > self.cluster_count {
                log::warn!("vvfat: directory chain at cluster {} does not terminate", start_cluster);
                break;
            }
        }

        return Ok(buffer);
    }

    /// Streams a guest file's cluster chain into the host file at `path`,
    /// then restores the FAT modification and access timestamps.
    fn write_guest_file(
        &mut self,
        path: &Path,
        entry: &DirEntry,
        create: bool,
        fat2: &Fat,
    ) -> Result<(), VvfatError> {
        let csize = self.cluster_size as usize;
        let rsvd_clusters = self.max_fat_value - 15;
        let bad_cluster = self.max_fat_value - 8;
        let mut remaining = entry.size as usize;
        let fstart = entry.begin_cluster();

        let mut options = OpenOptions::new();
        options.write(true).truncate(true);
        if create {
            options.create(true).mode(0o644);
        }
        let mut file = options.open(path)?;

        if (fstart >= 2) && (remaining > 0) {
            let mut buffer = vec![0u8; csize];
            let mut next = fstart;
            let mut followed = 0u32;

            loop {
                let cur = next;
                self.seek(SeekFrom::Start(self.cluster_to_sector(cur) * 512))?;
                self.read(&mut buffer)?;

                if remaining > csize {
                    file.write_all(&buffer)?;
                    remaining -= csize;
                } else {
                    file.write_all(&buffer[..remaining])?;
                    remaining = 0;
                }

                next = fat2.get(cur);
                if (next >= rsvd_clusters) && (next < bad_cluster) {
                    log::warn!("vvfat: reserved clusters not supported");
                }
                if (next >= rsvd_clusters) || (next < 2) {
                    break;
                }

                followed += 1;
                if followed > self.cluster_count {
                    log::warn!("vvfat: cluster chain of '{}' does not terminate", path.display());
                    break;
                }
            }
        }

        if let Some(mtime) = system_time_from_fat(entry.mdate, entry.mtime) {
            let atime = if entry.adate != 0 {
                system_time_from_fat(entry.adate, 0).unwrap_or(mtime)
            } else {
                mtime
            };
            let _ = file.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime));
        }

        return Ok(());
    }

    fn emit_attribute_line(&mut self, full_path: &Path, attributes: u8) {
        if let Some(writer) = self.attr_writer.as_mut() {
            let flags = attribute_flags_text(attributes);
            let rel_path = full_path
                .strip_prefix(&self.shadow_path)
                .unwrap_or(full_path);

            if let Err(e) = writeln!(writer, "\"{}\":{}", rel_path.display(), flags) {
                log::error!("vvfat: could not write attribute sidecar: {}", e);
            }
        }
    }

    /// A guest entry whose start cluster maps to nothing we know: a new
    /// directory or file (or one recreated over a reused path).
    fn apply_new_entry(
        &mut self,
        full_path: &Path,
        entry: &DirEntry,
        fat2: &Fat,
    ) -> Result<(), VvfatError> {
        if (entry.attributes & ATTR_DIRECTORY) != 0 {
            if let Err(e) = std::fs::create_dir(full_path) {
                log::error!("vvfat: mkdir '{}' failed: {}", full_path.display(), e);
            }
            self.parse_guest_directory(full_path, entry.begin_cluster(), fat2)?;
        } else if full_path.exists() {
            // the path lives on under a new identity; don't delete it later
            if let Some(index) = find_mapping_for_path(&self.mappings, full_path) {
                self.mappings.get_mut(index).deleted = false;
            }
            if let Err(e) = self.write_guest_file(full_path, entry, false, fat2) {
                log::error!("vvfat: rewrite '{}' failed: {}", full_path.display(), e);
            }
        } else if let Err(e) = self.write_guest_file(full_path, entry, true, fat2) {
            log::error!("vvfat: create '{}' failed: {}", full_path.display(), e);
        }

        return Ok(());
    }

    /// Recursive reconciliation walk: compares the guest's directory tree
    /// (per the committed FAT) against the mappings of the original scan and
    /// applies creations, rewrites and renames. Entries re-confirmed on the
    /// walk lose their `deleted` mark.
    fn parse_guest_directory(
        &mut self,
        path: &Path,
        start_cluster: u32,
        fat2: &Fat,
    ) -> Result<(), VvfatError> {
        let buffer = self.load_guest_directory(start_cluster, fat2)?;

        for guest in decode_directory(&buffer) {
            let full_path = path.join(&guest.filename);
            let attributes = guest.entry.attributes;

            if (attributes != ATTR_DIRECTORY) && (attributes != 0x20) {
                self.emit_attribute_line(&full_path, attributes);
            }

            let fstart = guest.entry.begin_cluster();

            let mapping_index = find_mapping_for_cluster(&self.mappings, fstart);
            let mapping_index = match mapping_index {
                None => {
                    self.apply_new_entry(&full_path, &guest.entry, fat2)?;
                    continue;
                }
                Some(index) => index,
            };

            let mapping_path: PathBuf = self.mappings.get(mapping_index).path.clone();
            let original = *self.directory.get(self.mappings.get(mapping_index).dir_index);

            if mapping_path == full_path {
                // unchanged location
                if (attributes & ATTR_DIRECTORY) != 0 {
                    self.parse_guest_directory(&full_path, fstart, fat2)?;
                } else if file_changed(&guest.entry, &original) {
                    if let Err(e) = self.write_guest_file(&full_path, &guest.entry, false, fat2)
                    {
                        log::error!("vvfat: rewrite '{}' failed: {}", full_path.display(), e);
                    }
                }
                self.mappings.get_mut(mapping_index).deleted = false;
            } else if (guest.entry.cdate == original.cdate)
                && (guest.entry.ctime == original.ctime)
            {
                // same creation stamp on a new path: the guest renamed it
                if let Err(e) = std::fs::rename(&mapping_path, &full_path) {
                    log::error!(
                        "vvfat: rename '{}' -> '{}' failed: {}",
                        mapping_path.display(),
                        full_path.display(),
                        e
                    );
                }

                if (attributes & ATTR_DIRECTORY) != 0 {
                    self.parse_guest_directory(&full_path, fstart, fat2)?;
                } else if file_changed(&guest.entry, &original) {
                    if let Err(e) = self.write_guest_file(&full_path, &guest.entry, false, fat2)
                    {
                        log::error!("vvfat: rewrite '{}' failed: {}", full_path.display(), e);
                    }
                }
                self.mappings.get_mut(mapping_index).deleted = false;
            } else {
                // the start cluster was recycled for an unrelated entry
                self.apply_new_entry(&full_path, &guest.entry, fat2)?;
            }
        }

        return Ok(());
    }

    /// Reads the FAT of record back through the overlay and reconciles the
    /// guest's directory tree with the host directory.
    ///
    /// Mutation failures (a rename, a rewrite, a removal) are logged and
    /// skipped; a failure to read the guest's own structures aborts the
    /// commit before anything is deleted.
    pub(crate) fn commit_changes(&mut self) -> Result<(), VvfatError> {
        log::debug!(
            "vvfat: writing back changes to directory '{}'",
            self.shadow_path.display()
        );

        let mut fat2_bytes = vec![0u8; (self.sectors_per_fat as usize) * 512];
        self.seek(SeekFrom::Start((self.offset_to_fat as u64) * 512))?;
        self.read(&mut fat2_bytes)?;
        let fat2 = Fat::from_bytes(self.fat_type, fat2_bytes);

        // candidates for deletion until the walk re-confirms them
        for i in 1..self.mappings.next() {
            if self.mappings.get(i).first_mapping_index.is_none() {
                self.mappings.get_mut(i).deleted = true;
            }
        }

        let sidecar = self.shadow_path.join(VVFAT_ATTR);
        self.attr_writer = File::create(&sidecar).ok();

        let root_cluster = if self.fat_type == FatType::Fat32 {
            self.first_cluster_of_root_dir
        } else {
            0
        };
        let root_path = self.shadow_path.clone();
        let walk = self.parse_guest_directory(&root_path, root_cluster, &fat2);

        self.attr_writer = None;

        // an aborted walk must not reach the deletion sweep
        walk?;

        for i in (1..self.mappings.next()).rev() {
            if !self.mappings.get(i).deleted {
                continue;
            }

            let dir_index = self.mappings.get(i).dir_index;
            let path = self.mappings.get(i).path.clone();

            if self.directory.get(dir_index).attributes == ATTR_DIRECTORY {
                if let Err(e) = std::fs::remove_dir(&path) {
                    log::error!("vvfat: rmdir '{}' failed: {}", path.display(), e);
                }
            } else if let Err(e) = std::fs::remove_file(&path) {
                log::error!("vvfat: unlink '{}' failed: {}", path.display(), e);
            }
        }

        return Ok(());
    }
}
