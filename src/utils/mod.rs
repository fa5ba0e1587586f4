pub mod time;

pub use time::{next_friday, Clock, FixedClock, SystemClock};
