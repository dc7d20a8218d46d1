use std::fmt;
use zkctl_core::UnitId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultType {
    /// Server unreachable; its controller keeps running
    ServerCrash { unit: UnitId },
    ServerRecover { unit: UnitId },
    /// The next `count` restarts come back not serving
    FailingRestarts { unit: UnitId, count: u32 },
    /// Controller stops running passes, so its heartbeat goes stale
    ControllerFreeze { unit: UnitId },
    ControllerThaw { unit: UnitId },
    /// Unit and server vanish without a chance to clean up
    UnitLost { unit: UnitId },
}

impl FaultType {
    pub fn unit(&self) -> UnitId {
        match self {
            FaultType::ServerCrash { unit }
            | FaultType::ServerRecover { unit }
            | FaultType::FailingRestarts { unit, .. }
            | FaultType::ControllerFreeze { unit }
            | FaultType::ControllerThaw { unit }
            | FaultType::UnitLost { unit } => *unit,
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultType::ServerCrash { unit } => write!(f, "crash server {}", unit),
            FaultType::ServerRecover { unit } => write!(f, "recover server {}", unit),
            FaultType::FailingRestarts { unit, count } => {
                write!(f, "fail next {} restarts of {}", count, unit)
            }
            FaultType::ControllerFreeze { unit } => write!(f, "freeze controller {}", unit),
            FaultType::ControllerThaw { unit } => write!(f, "thaw controller {}", unit),
            FaultType::UnitLost { unit } => write!(f, "lose unit {}", unit),
        }
    }
}
