//! The stage library: concrete [`Stage`](crate::stage::Stage) implementations
//! for building chains over lines, records and counts.

pub mod batch;
pub mod count;
pub mod dedup;
pub mod delay;
pub mod group;
pub mod mutate;
pub mod parse;
pub mod print;
pub mod route;
pub mod split;

pub use batch::Batch;
pub use count::{count_tokens, timeline, Count, Counts, SharedCounts};
pub use dedup::Dedup;
pub use delay::Delay;
pub use group::{GroupSink, OpenMode, TimeTemplate};
pub use mutate::Mutate;
pub use parse::ToRecord;
pub use print::{CounterPrinter, PrintSink, RecordFormat};
pub use route::{Predicate, Route};
pub use split::Split;
