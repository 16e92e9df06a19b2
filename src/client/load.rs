//! Connection utilization reporting

use serde::Serialize;
use std::iter::Sum;

/// Locked versus total connections at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionLoad {
    pub num_connections: usize,
    pub num_locked_connections: usize,
}

impl ConnectionLoad {
    pub fn new(num_connections: usize, num_locked_connections: usize) -> Self {
        Self {
            num_connections,
            num_locked_connections,
        }
    }

    pub fn aggregate(&mut self, other: ConnectionLoad) {
        self.num_connections += other.num_connections;
        self.num_locked_connections += other.num_locked_connections;
    }

    /// Share of locked connections, 0 to 100
    pub fn load_percent(&self) -> f64 {
        if self.num_connections == 0 {
            return 0.0;
        }
        self.num_locked_connections as f64 * 100.0 / self.num_connections as f64
    }
}

impl Sum for ConnectionLoad {
    fn sum<I: Iterator<Item = ConnectionLoad>>(iter: I) -> Self {
        iter.fold(ConnectionLoad::default(), |mut total, load| {
            total.aggregate(load);
            total
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_percent() {
        assert_eq!(ConnectionLoad::default().load_percent(), 0.0);
        assert_eq!(ConnectionLoad::new(4, 1).load_percent(), 25.0);
    }

    #[test]
    fn test_sum() {
        let total: ConnectionLoad = vec![ConnectionLoad::new(2, 1), ConnectionLoad::new(6, 1)]
            .into_iter()
            .sum();
        assert_eq!(total, ConnectionLoad::new(8, 2));
        assert_eq!(total.load_percent(), 25.0);
    }
}
