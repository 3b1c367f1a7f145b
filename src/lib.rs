pub mod aggregate;
pub mod bench;
pub mod error;
pub mod group;
pub mod reduce;
pub mod sync;
pub mod table;

pub use aggregate::{Aggregator, Round, RoundOptions, RoundState};
pub use error::{ConfigurationError, Error};
pub use group::{MemberId, MemberList};
pub use reduce::{Column, ReduceOp, Reducer};
