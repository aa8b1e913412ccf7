//! Object naming inside a storage folder.
//!
//! A folder holds either the parts of an upload (`{folder}/parts/{index}`),
//! the consolidated object (`{folder}/merged`), or both while a merge is
//! being reclaimed.

/// Folder holding the individual parts.
pub fn parts_folder(folder: &str) -> String {
    format!("{folder}/parts")
}

/// Object name of one part.
pub fn part_object(folder: &str, index: u32) -> String {
    format!("{folder}/parts/{index}")
}

/// Object name of the consolidated object.
pub fn merged_object(folder: &str) -> String {
    format!("{folder}/merged")
}
