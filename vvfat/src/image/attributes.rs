use crate::image::image::{VvfatImage, VVFAT_ATTR};
use crate::image::mapping::find_mapping_for_path;
use std::path::{Path, PathBuf};

/// Renders the sidecar flags for a non-plain attribute byte: `a` when the
/// archive bit is clear on a file, `S`/`H`/`R` for system, hidden and
/// read-only. A system entry's `S` supersedes the `a`.
pub(crate) fn attribute_flags_text(attributes: u8) -> String {
    let mut text = String::new();

    if (attributes & 0x30) == 0 {
        text.push('a');
    }
    if (attributes & 0x04) != 0 {
        text = String::from("S");
    }
    if (attributes & 0x02) != 0 {
        text.push('H');
    }
    if (attributes & 0x01) != 0 {
        text.push('R');
    }

    return text;
}

impl VvfatImage {
    /// Folds `vvfat_attr.cfg` lines of the form `"relative/path":flags`
    /// into the directory entries of the freshly scanned volume. Lines
    /// naming unknown paths are ignored.
    pub(crate) fn set_file_attributes(&mut self) {
        let sidecar = self.shadow_path.join(VVFAT_ATTR);
        let content = match std::fs::read_to_string(&sidecar) {
            Ok(content) => content,
            Err(_) => return,
        };

        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.splitn(2, ':');
            let raw_path = match parts.next() {
                Some(p) => p.trim_matches('"'),
                None => continue,
            };
            let flags = parts.next().unwrap_or("");

            let full_path = if Path::new(raw_path).starts_with(&self.shadow_path) {
                PathBuf::from(raw_path)
            } else {
                self.shadow_path.join(raw_path)
            };

            let mapping_index = match find_mapping_for_path(&self.mappings, &full_path) {
                Some(index) => index,
                None => continue,
            };

            let dir_index = self.mappings.get(mapping_index).dir_index;
            let entry = self.directory.get_mut(dir_index);

            let mut attributes = entry.attributes;
            for flag in flags.chars() {
                match flag {
                    'a' => attributes &= !0x20,
                    'S' => attributes |= 0x04,
                    'H' => attributes |= 0x02,
                    'R' => attributes |= 0x01,
                    _ => (),
                }
            }
            entry.attributes = attributes;
        }
    }
}
