use crate::model::AttendanceStatus;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Default cutoff for classifying an arrival as late.
pub const DEFAULT_LATE_THRESHOLD: (u32, u32) = (8, 0);

pub fn default_late_threshold() -> NaiveTime {
    NaiveTime::from_hms_opt(DEFAULT_LATE_THRESHOLD.0, DEFAULT_LATE_THRESHOLD.1, 0)
        .unwrap_or_default()
}

/// An arrival is late strictly after the threshold; arriving exactly on it is on time.
pub fn is_late(at: NaiveTime, threshold: NaiveTime) -> bool {
    at > threshold
}

pub fn classify_arrival(at: NaiveTime, threshold: NaiveTime) -> AttendanceStatus {
    if is_late(at, threshold) {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Arithmetic mean rounded to 2 decimals; 0 for an empty slice.
pub fn mean_2dp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().sum();
    round_2dp(sum / values.len() as f64)
}

/// `count / total` as a whole percentage, rounded to nearest; 0 when `total == 0`.
pub fn percentage(count: usize, total: usize) -> i64 {
    if total == 0 {
        return 0;
    }
    (100.0 * count as f64 / total as f64).round() as i64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
}

impl AttendanceCounts {
    pub fn add(&mut self, status: AttendanceStatus) {
        self.total += 1;
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
        }
    }

    pub fn percentages(&self) -> AttendancePercentages {
        AttendancePercentages {
            present: percentage(self.present, self.total),
            absent: percentage(self.absent, self.total),
            late: percentage(self.late, self.total),
            // Late arrivals still attended.
            attendance: percentage(self.present + self.late, self.total),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendancePercentages {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub attendance: i64,
}

pub fn tally_attendance<I>(statuses: I) -> AttendanceCounts
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut counts = AttendanceCounts::default();
    for s in statuses {
        counts.add(s);
    }
    counts
}

pub fn count_by<K, I>(keys: I) -> BTreeMap<K, usize>
where
    K: Ord,
    I: IntoIterator<Item = K>,
{
    let mut out = BTreeMap::new();
    for k in keys {
        *out.entry(k).or_insert(0) += 1;
    }
    out
}

pub fn distinct_count<'a, I>(ids: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    ids.into_iter().collect::<BTreeSet<_>>().len()
}

/// Distinct members per key, e.g. distinct student ids per grade id.
pub fn distinct_by_key<K, M, I>(pairs: I) -> BTreeMap<K, usize>
where
    K: Ord,
    M: Ord,
    I: IntoIterator<Item = (K, M)>,
{
    let mut sets: BTreeMap<K, BTreeSet<M>> = BTreeMap::new();
    for (k, m) in pairs {
        sets.entry(k).or_default().insert(m);
    }
    sets.into_iter().map(|(k, s)| (k, s.len())).collect()
}

/// Mean value per key, rounded to 2 decimals.
pub fn grouped_means<K, I>(pairs: I) -> BTreeMap<K, f64>
where
    K: Ord,
    I: IntoIterator<Item = (K, f64)>,
{
    let mut buckets: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for (k, v) in pairs {
        buckets.entry(k).or_default().push(v);
    }
    buckets
        .into_iter()
        .map(|(k, vals)| (k, mean_2dp(&vals)))
        .collect()
}

pub fn daily_histogram<I>(records: I) -> BTreeMap<NaiveDate, AttendanceCounts>
where
    I: IntoIterator<Item = (NaiveDate, AttendanceStatus)>,
{
    let mut out: BTreeMap<NaiveDate, AttendanceCounts> = BTreeMap::new();
    for (day, status) in records {
        out.entry(day).or_default().add(status);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub count: usize,
    pub average: f64,
    pub period_averages: BTreeMap<String, f64>,
}

pub fn score_summary<'a, I>(scores: I) -> ScoreSummary
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let pairs: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(period, v)| (period.to_string(), v))
        .collect();
    let values: Vec<f64> = pairs.iter().map(|(_, v)| *v).collect();
    ScoreSummary {
        count: values.len(),
        average: mean_2dp(&values),
        period_averages: grouped_means(pairs),
    }
}
