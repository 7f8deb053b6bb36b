//! Routing of client messages to local handlers or remote workers.
//!
//! The [`Router`] decides, per message, whether the route's server type is
//! served inside this gateway or must be forwarded to one instance of a remote
//! pool picked by a [`LoadBalancer`].

pub mod balancer;
pub mod router;

pub use balancer::{BalancerKind, LoadBalancer, RoundRobin, UniformRandom, WeightedRandom};
pub use router::{LocalHandler, RouteOutcome, Router};
