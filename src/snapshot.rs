use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, SubsecRound as _, Utc};
use serde::{Deserialize, Serialize};

/// Zero-padded width of the revision fields in a snapshot key.
///
/// Wide enough for any `u64`, so keys of the same kind sort lexicographically by revision.
pub const REVISION_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotKind {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "incr")]
    Incremental,
}

impl SnapshotKind {
    /// Short code used in snapshot keys.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incr",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incr" => Ok(Self::Incremental),
            other => Err(format!("unknown snapshot kind: {other} (expected full|incr)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRevisionRange {
    pub start: u64,
    pub last: u64,
}

impl fmt::Display for InvalidRevisionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid revision range: start_revision={} > last_revision={}",
            self.start, self.last
        )
    }
}

impl std::error::Error for InvalidRevisionRange {}

/// Metadata of one stored snapshot artifact.
///
/// `path` is the artifact key relative to the store's container/prefix. It is derived from the
/// other fields, so two snapshots with different kind, revisions or creation second never share
/// a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    pub start_revision: u64,
    pub last_revision: u64,
    /// Creation time, truncated to whole seconds (the key stores unix seconds).
    pub created_on: DateTime<Utc>,
    pub path: String,
}

impl Snapshot {
    pub fn new(
        kind: SnapshotKind,
        start_revision: u64,
        last_revision: u64,
        created_on: DateTime<Utc>,
    ) -> Result<Self, InvalidRevisionRange> {
        if start_revision > last_revision {
            return Err(InvalidRevisionRange {
                start: start_revision,
                last: last_revision,
            });
        }
        let created_on = created_on.trunc_subsecs(0);
        let path = encode_key(kind, start_revision, last_revision, &created_on);
        Ok(Self {
            kind,
            start_revision,
            last_revision,
            created_on,
            path,
        })
    }

    /// Parse an artifact key produced by [`Snapshot::new`].
    ///
    /// Only the canonical encoding is accepted; anything else (temp files, foreign objects,
    /// non-padded revisions) yields `None`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, '-');
        let kind = parts.next()?.parse::<SnapshotKind>().ok()?;
        let start_revision = parts.next()?.parse::<u64>().ok()?;
        let last_revision = parts.next()?.parse::<u64>().ok()?;
        let secs = parts.next()?.parse::<i64>().ok()?;
        let created_on = DateTime::from_timestamp(secs, 0)?;

        let snap = Self::new(kind, start_revision, last_revision, created_on).ok()?;
        (snap.path == key).then_some(snap)
    }

    pub fn is_full(&self) -> bool {
        self.kind == SnapshotKind::Full
    }

    /// Timeline order: `last_revision`, then `created_on`, then full before incremental.
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.last_revision
            .cmp(&other.last_revision)
            .then_with(|| self.created_on.cmp(&other.created_on))
            .then_with(|| other.is_full().cmp(&self.is_full()))
            .then_with(|| self.start_revision.cmp(&other.start_revision))
    }
}

fn encode_key(
    kind: SnapshotKind,
    start_revision: u64,
    last_revision: u64,
    created_on: &DateTime<Utc>,
) -> String {
    format!(
        "{}-{:0width$}-{:0width$}-{}",
        kind.code(),
        start_revision,
        last_revision,
        created_on.timestamp(),
        width = REVISION_WIDTH
    )
}

pub fn sort_timeline(snaps: &mut [Snapshot]) {
    snaps.sort_by(Snapshot::timeline_cmp);
}

/// The snapshot with the greatest `last_revision` (ties broken by `created_on`).
pub fn latest(snaps: &[Snapshot]) -> Option<&Snapshot> {
    snaps.iter().max_by(|a, b| a.timeline_cmp(b))
}

/// A full snapshot plus the contiguous incrementals to replay on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreChain {
    pub full: Snapshot,
    pub incrementals: Vec<Snapshot>,
}

impl RestoreChain {
    pub fn last_revision(&self) -> u64 {
        self.incrementals
            .last()
            .map(|s| s.last_revision)
            .unwrap_or(self.full.last_revision)
    }

    /// Snapshots in replay order.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        std::iter::once(&self.full).chain(self.incrementals.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// An incremental after the anchor does not start right after its predecessor.
    Broken { expected_start: u64, found: Snapshot },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broken {
                expected_start,
                found,
            } => write!(
                f,
                "broken snapshot chain: expected incremental starting at {expected_start}, found {}",
                found.path
            ),
        }
    }
}

impl std::error::Error for ChainError {}

/// Build the replay chain reaching `target` (or as far as possible when `None`).
///
/// The chain is anchored at the latest full snapshot with `last_revision <= target`.
/// Incrementals that end at or before the anchor belong to an earlier epoch and are skipped.
pub fn restore_chain(
    snaps: &[Snapshot],
    target: Option<u64>,
) -> Result<Option<RestoreChain>, ChainError> {
    let mut ordered: Vec<&Snapshot> = snaps.iter().collect();
    ordered.sort_by(|a, b| a.timeline_cmp(b));

    let within = |s: &Snapshot| target.is_none_or(|t| s.last_revision <= t);

    let Some(anchor) = ordered.iter().rposition(|s| s.is_full() && within(s)) else {
        return Ok(None);
    };
    let full = ordered[anchor].clone();

    let mut incrementals = Vec::new();
    let mut next_start = full.last_revision.saturating_add(1);
    for snap in &ordered[anchor + 1..] {
        if snap.is_full() || snap.last_revision <= full.last_revision {
            continue;
        }
        if !within(snap) {
            break;
        }
        if snap.start_revision != next_start {
            return Err(ChainError::Broken {
                expected_start: next_start,
                found: (*snap).clone(),
            });
        }
        next_start = snap.last_revision.saturating_add(1);
        incrementals.push((*snap).clone());
    }

    Ok(Some(RestoreChain { full, incrementals }))
}

/// Snapshots older than the `max_full` newest full snapshots.
///
/// At least one full snapshot (and its incrementals) is always kept.
pub fn garbage(snaps: &[Snapshot], max_full: usize) -> Vec<Snapshot> {
    let mut ordered = snaps.to_vec();
    sort_timeline(&mut ordered);

    let full_positions: Vec<usize> = ordered
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_full())
        .map(|(i, _)| i)
        .collect();
    let keep = max_full.max(1);
    if full_positions.len() <= keep {
        return Vec::new();
    }
    let oldest_kept = full_positions[full_positions.len() - keep];
    ordered.truncate(oldest_kept);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn full(last: u64, secs: i64) -> Snapshot {
        Snapshot::new(SnapshotKind::Full, 0, last, at(secs)).unwrap()
    }

    fn incr(start: u64, last: u64, secs: i64) -> Snapshot {
        Snapshot::new(SnapshotKind::Incremental, start, last, at(secs)).unwrap()
    }

    #[test]
    fn key_encodes_kind_revisions_and_seconds() {
        let snap = incr(201, 250, 1_700_000_000);
        assert_eq!(
            snap.path,
            "incr-00000000000000000201-00000000000000000250-1700000000"
        );
        assert_eq!(Snapshot::parse_key(&snap.path), Some(snap));
    }

    #[test]
    fn new_truncates_subsecond_precision() {
        let created = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let snap = Snapshot::new(SnapshotKind::Full, 0, 10, created).unwrap();
        assert_eq!(snap.created_on, at(1_700_000_000));
        assert_eq!(Snapshot::parse_key(&snap.path).unwrap(), snap);
    }

    #[test]
    fn new_rejects_inverted_range() {
        let err = Snapshot::new(SnapshotKind::Incremental, 10, 9, at(0)).unwrap_err();
        assert_eq!(err, InvalidRevisionRange { start: 10, last: 9 });
    }

    #[test]
    fn parse_key_rejects_non_canonical_keys() {
        for key in [
            "",
            "full",
            "full-1-2-3",
            "delta-00000000000000000001-00000000000000000002-3",
            "full-00000000000000000001-00000000000000000002-3.tmp",
            "incr-00000000000000000005-00000000000000000002-3",
            "Full-00000000000000000001-00000000000000000002-3",
            "full-00000000000000000001-00000000000000000002-+3",
        ] {
            assert_eq!(Snapshot::parse_key(key), None, "key={key:?}");
        }
    }

    #[test]
    fn latest_picks_greatest_last_revision_then_newest() {
        let snaps = vec![full(100, 10), incr(101, 150, 20), full(150, 30), full(90, 40)];
        assert_eq!(latest(&snaps), Some(&snaps[2]));
        assert_eq!(latest(&[]), None);
    }

    #[test]
    fn sort_timeline_orders_by_last_revision() {
        let mut snaps = vec![incr(201, 250, 30), full(200, 20), full(100, 10)];
        sort_timeline(&mut snaps);
        let revs: Vec<u64> = snaps.iter().map(|s| s.last_revision).collect();
        assert_eq!(revs, vec![100, 200, 250]);
    }

    #[test]
    fn restore_chain_anchors_on_latest_full() {
        let snaps = vec![
            full(100, 10),
            incr(101, 150, 15),
            full(200, 20),
            incr(201, 250, 30),
            incr(251, 300, 40),
        ];
        let chain = restore_chain(&snaps, None).unwrap().unwrap();
        assert_eq!(chain.full, snaps[2]);
        assert_eq!(chain.incrementals, vec![snaps[3].clone(), snaps[4].clone()]);
        assert_eq!(chain.last_revision(), 300);
        assert_eq!(chain.iter().count(), 3);
    }

    #[test]
    fn restore_chain_stops_at_target() {
        let snaps = vec![
            full(100, 10),
            incr(101, 150, 15),
            incr(151, 180, 16),
            full(200, 20),
        ];
        let chain = restore_chain(&snaps, Some(160)).unwrap().unwrap();
        assert_eq!(chain.full, snaps[0]);
        assert_eq!(chain.incrementals, vec![snaps[1].clone()]);
        assert_eq!(chain.last_revision(), 150);
    }

    #[test]
    fn restore_chain_reports_gaps() {
        let snaps = vec![full(100, 10), incr(101, 150, 15), incr(160, 170, 16)];
        let err = restore_chain(&snaps, None).unwrap_err();
        assert_eq!(
            err,
            ChainError::Broken {
                expected_start: 151,
                found: snaps[2].clone(),
            }
        );
    }

    #[test]
    fn restore_chain_skips_incrementals_of_previous_epoch() {
        let snaps = vec![full(100, 10), incr(101, 200, 19), full(200, 20), incr(201, 210, 30)];
        let chain = restore_chain(&snaps, None).unwrap().unwrap();
        assert_eq!(chain.full, snaps[2]);
        assert_eq!(chain.incrementals, vec![snaps[3].clone()]);
    }

    #[test]
    fn restore_chain_without_full_is_none() {
        assert_eq!(restore_chain(&[incr(1, 5, 1)], None).unwrap(), None);
        assert_eq!(restore_chain(&[full(100, 1)], Some(50)).unwrap(), None);
    }

    #[test]
    fn garbage_keeps_newest_full_epochs() {
        let snaps = vec![
            full(100, 10),
            incr(101, 150, 15),
            full(200, 20),
            incr(201, 250, 25),
            full(300, 30),
        ];
        assert_eq!(garbage(&snaps, 2), vec![snaps[0].clone(), snaps[1].clone()]);
        assert_eq!(garbage(&snaps, 3), Vec::<Snapshot>::new());
        assert_eq!(garbage(&snaps, 0).len(), 4);
    }
}
