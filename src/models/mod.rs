pub mod assignment;
pub mod bus;
pub mod route;

pub use assignment::{Assignment, AssignmentStatus};
pub use bus::{BusSnapshot, BusStatus, GeoPoint, LastSeen, LastSeenStatus};
pub use route::{Route, Stop};
