//! Retention selection over a remote backup listing

use crate::database::Result;
use crate::database::backup_naming::NamingPattern;

/// Backups to keep and backups to delete, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPartition {
    pub keep: Vec<String>,
    pub delete: Vec<String>,
}

/// Split the backups found in a listing into the `keep_count` newest and the rest
///
/// Filenames that do not match the naming pattern are ignored. Backups are
/// ordered by their embedded date, newest first; equal dates keep their
/// listing order. A matching filename whose date cannot be parsed fails the
/// whole selection.
pub fn select_retention<I, S>(
    filenames: I,
    pattern: &NamingPattern,
    keep_count: usize,
) -> Result<RetentionPartition>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dated = Vec::new();
    for filename in filenames {
        let filename = filename.as_ref();
        if let Some(timestamp) = pattern.backup_timestamp(filename)? {
            dated.push((timestamp, filename.to_string()));
        }
    }

    // sort_by is stable, ties stay in listing order
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    let mut keep: Vec<String> = dated.into_iter().map(|(_, filename)| filename).collect();
    let delete = keep.split_off(keep_count.min(keep.len()));

    Ok(RetentionPartition { keep, delete })
}
