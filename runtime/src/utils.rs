use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

/// A point in time seen through both clocks the room needs
///
/// `instant` drives timers and is pausable under tokio's test clock;
/// `wall_ms` is what gets written into state and phase-change records.
#[derive(Debug, Clone, Copy)]
pub struct Moment {
    pub instant: Instant,
    pub wall_ms: u64,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall_ms: get_timestamp(),
        }
    }

    /// The same moment shifted forward on both clocks
    pub fn after(&self, elapsed: Duration) -> Self {
        Self {
            instant: self.instant + elapsed,
            wall_ms: self.wall_ms.saturating_add(elapsed.as_millis() as u64),
        }
    }
}

// Levenshtein distance, giving up once it exceeds `bound`
pub fn bounded_edit_distance(a: &str, b: &str, bound: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > bound {
        return None;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > bound {
            return None;
        }
        std::mem::swap(&mut previous, &mut current);
    }

    let distance = previous[b.len()];
    (distance <= bound).then_some(distance)
}

/// Closest candidate to `name` within a length-scaled edit distance
pub fn suggest<'a, I>(name: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let bound = (name.chars().count() / 3).max(2);
    candidates
        .into_iter()
        .filter_map(|candidate| {
            bounded_edit_distance(name, candidate, bound).map(|distance| (distance, candidate))
        })
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}
