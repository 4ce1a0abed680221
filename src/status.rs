use std::sync::atomic::{AtomicU8, Ordering};

/// Service status exposed through the `/mon` endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Fail,
    Ok,
    Maintenance,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Maintenance => "MAINTENANCE",
            Self::Fail => "FAIL",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ok,
            2 => Self::Maintenance,
            _ => Self::Fail,
        }
    }
}

#[derive(Debug)]
pub struct StatusMonitor {
    status: AtomicU8,
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(Self::encode(Status::Ok)),
        }
    }
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(Self::encode(status), Ordering::Release);
    }

    /// Atomically replaces the status, returning the previous one.
    pub fn exchange_status(&self, status: Status) -> Status {
        Status::from_u8(self.status.swap(Self::encode(status), Ordering::AcqRel))
    }

    fn encode(status: Status) -> u8 {
        match status {
            Status::Fail => 0,
            Status::Ok => 1,
            Status::Maintenance => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_returns_previous() {
        let monitor = StatusMonitor::new();
        assert_eq!(monitor.status(), Status::Ok);
        assert_eq!(monitor.exchange_status(Status::Maintenance), Status::Ok);
        assert_eq!(monitor.status(), Status::Maintenance);
        assert_eq!(monitor.exchange_status(Status::Maintenance), Status::Maintenance);
        monitor.set_status(Status::Fail);
        assert_eq!(monitor.status().as_str(), "FAIL");
    }
}
