use crate::identity::ProcessId;
use crate::store::Record;

/// Drops every record that all of `known` has acknowledged.
///
/// Returns the number of records removed. An empty `known` set prunes
/// nothing: with no membership evidence nobody can be said to have seen a
/// record.
pub fn prune_acknowledged(records: &mut Vec<Record>, known: &[ProcessId]) -> usize {
    if known.is_empty() {
        return 0;
    }
    let before = records.len();
    records.retain(|record| !record.acked_by_all(known));
    before - records.len()
}
