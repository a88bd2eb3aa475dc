use crate::arena::Arena;
use std::path::{Path, PathBuf};

/// What a mapping stands for in the shadowed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// Placeholder while scanning; promoted to `Normal` during cluster
    /// assignment.
    Undefined,
    Normal,
    Directory,
}

impl Default for MappingKind {
    fn default() -> Self {
        return MappingKind::Undefined;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingInfo {
    File {
        /// Byte offset into the host file where this mapping's first cluster
        /// begins. Always 0 today: the scanner emits one contiguous run per
        /// file.
        offset: u32,
    },
    Dir {
        parent_mapping_index: Option<usize>,
        /// Index of the first of this directory's entries in the directory
        /// arena.
        first_dir_index: usize,
    },
}

impl Default for MappingInfo {
    fn default() -> Self {
        return MappingInfo::File { offset: 0 };
    }
}

/// Correspondence between one host filesystem object and a cluster range of
/// the virtual volume.
///
/// Mappings covering the data area are sorted by `begin`, pairwise
/// non-overlapping, with `begin < end`; the read path's binary search
/// depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    /// First cluster, and one past the last. During the scan `end`
    /// temporarily holds the file size until clusters are assigned.
    pub begin: u32,
    pub end: u32,
    /// Index of the 8.3 entry in the directory arena.
    pub dir_index: usize,
    /// First mapping of a split cluster chain. The scanner never splits
    /// today (every file is one contiguous run; the read and write paths
    /// require that), so this is `None` for every mapping it creates.
    pub first_mapping_index: Option<usize>,
    pub info: MappingInfo,
    pub path: PathBuf,
    pub kind: MappingKind,
    /// Transient commit-engine state: set for every candidate at the start
    /// of a commit, cleared as the guest directory walk re-confirms entries.
    pub deleted: bool,
    pub read_only: bool,
}

/// Binary search over the `begin`-sorted mapping arena for the mapping whose
/// `[begin, end)` range covers `cluster`.
pub fn find_mapping_for_cluster(mappings: &Arena<Mapping>, cluster: u32) -> Option<usize> {
    let slice = mappings.as_slice();
    let index = slice.partition_point(|m| m.begin <= cluster);

    if index == 0 {
        return None;
    }

    let candidate = index - 1;
    if cluster < slice[candidate].end {
        return Some(candidate);
    }

    return None;
}

/// Linear scan for the mapping shadowing `path`. Restricted to mappings that
/// head their own chain; only called on the mutation paths, so O(n) is
/// acceptable.
pub fn find_mapping_for_path(mappings: &Arena<Mapping>, path: &Path) -> Option<usize> {
    for i in 0..mappings.next() {
        let mapping = mappings.get(i);
        if mapping.first_mapping_index.is_none() && mapping.path == path {
            return Some(i);
        }
    }

    return None;
}
