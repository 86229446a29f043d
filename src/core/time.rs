//! Управление временем симуляции

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Тип для представления времени в симуляции
///
/// Полный порядок через `f64::total_cmp`, чтобы время могло служить
/// ключом очереди событий.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimTime(f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);

    pub fn new(seconds: f64) -> Self {
        SimTime(seconds)
    }

    pub fn as_seconds(&self) -> f64 {
        self.0
    }

    pub fn from_seconds(seconds: f64) -> Self {
        SimTime(seconds)
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add for SimTime {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        SimTime(self.0 + other.0)
    }
}

impl Sub for SimTime {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        SimTime((self.0 - other.0).max(0.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = Self;

    fn add(self, delay: Duration) -> Self {
        SimTime(self.0 + delay.as_seconds())
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

/// Длительность между моментами симуляции
#[derive(Debug, Clone, Copy)]
pub struct Duration(f64);

impl Duration {
    pub fn from_seconds(secs: f64) -> Self {
        Duration(secs)
    }

    pub fn as_seconds(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_for_map_keys() {
        let mut times = vec![
            SimTime::new(8.0),
            SimTime::new(2.0),
            SimTime::new(5.0),
        ];
        times.sort();
        assert_eq!(times[0], SimTime::new(2.0));
        assert_eq!(times[1], SimTime::new(5.0));
        assert_eq!(times[2], SimTime::new(8.0));
    }

    #[test]
    fn add_duration() {
        let t = SimTime::new(3.0) + Duration::from_seconds(2.5);
        assert_eq!(t, SimTime::new(5.5));
    }
}
