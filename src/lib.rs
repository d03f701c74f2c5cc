//! Lazy, self-memoizing computation graph.
//!
//! `calcgraph` turns ordinary functions into nodes of a directed acyclic
//! dependency graph. Each unique call, keyed by function identity plus
//! arguments, is computed at most once; results are cached, dependency
//! edges are recorded as calls happen (and statically from declared call
//! plans), and invalidating a node transitively evicts everything that
//! depends on it.
//!
//! ```
//! use calcgraph::CalcEngine;
//!
//! let engine = CalcEngine::new();
//!
//! let rate = engine
//!     .register("rate")
//!     .path("demo")
//!     .build(|_: ()| Ok(100i64));
//!
//! let r = rate.clone();
//! let price = engine
//!     .register("price")
//!     .path("demo")
//!     .calls(rate.site())
//!     .build(move |(qty,): (i64,)| Ok(qty * r.call(())?));
//!
//! assert_eq!(price.call((3,)).unwrap(), 300);
//! // Served from cache; the body does not run again.
//! assert_eq!(price.call((3,)).unwrap(), 300);
//!
//! // Overriding the rate evicts every node that requires it.
//! rate.set_value_and_invalidate(200, ()).unwrap();
//! assert_eq!(price.call((3,)).unwrap(), 600);
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod helper;
pub mod id;
pub mod key;
pub mod scan;

// Re-export commonly used types
pub use engine::{CalcEngine, EngineConfig, Node, NodeBuilder};
pub use error::{BoxError, CalcError};
pub use event::{EventChannel, SubscriberId};
pub use graph::{CacheSnapshot, NodeSnapshot};
pub use helper::FunctionHelper;
pub use id::{IdAtom, LongId, ShortId, KWD_MARK};
pub use key::{ArgKey, CallParts, FloatBits, Instance, KeyPart, Kwargs, NodeArgs};
pub use scan::{CallPlan, CallSite};
