//! Target allow-list rules
//!
//! Allow-list entries are compiled once at startup into [`TargetRule`]
//! variants and evaluated in insertion order by the [`TargetAuthorizer`].
//! An empty rule list allows every target.
//!
//! # Entry syntax
//!
//! | Entry | Compiled rule | Matches |
//! |---|---|---|
//! | `10.0.0.0/8` | `Cidr` | any `host:port` whose host is an IP inside the network |
//! | `*.example.com` | `WildcardDomain` | full `host:port` string against the anchored pattern |
//! | `127.0.0.1:22` | `Exact` | the exact `host:port` string |
//! | `example.com` | `ExactDomain` | the host portion, port ignored |

mod engine;
mod types;

pub use engine::TargetAuthorizer;
pub use types::{split_host_port, TargetRule};
