mod bound;
mod filter;
mod listen_sequence;
mod order_by;
mod query;
mod target;

pub use bound::Bound;
pub use filter::{
    CompositeFilter, CompositeOperator, Filter, NanFilter, NullFilter, Operator, RelationFilter,
};
pub use listen_sequence::{
    BatchId, ListenSequence, ListenSequenceNumber, TargetId, TargetIdGenerator,
    INVALID_SEQUENCE_NUMBER,
};
pub use order_by::{Direction, OrderBy};
pub use query::{LimitType, Query};
pub use target::Target;
