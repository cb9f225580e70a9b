//! Batchloader is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It provides an interface to batch multiple similar
//! requests into a single batch operation, then distribute the results to
//! each requester, without the requester knowing anything about the batch
//! operation. Requests are also memoized, so that asking for the same key
//! twice shares a single request. The common use case for this is batching
//! requests to an API or a database from a tree of resolvers, but it can be
//! used for any situation where it'd be useful to hide batching logic.
//!
//! ## Overview
//!
//! As a simple example, suppose you had an API to fetch user data by username.
//! The API supports batching; that is, you can supply multiple usernames in
//! the same request and it will return results for all of them. However, your
//! application code only ever needs a single user at a time. You still want
//! those lookups batched, to reduce API pressure; this is where batchloader
//! comes in.
//!
//! First, adapt your batching function to the batchloader API. A batch
//! function takes a `Vec` of keys and asynchronously returns one result per
//! key, in the same order as the keys:
//!
//! ```
//! # #[derive(Debug, Clone)] struct UserData { username: String }
//! #[derive(Debug, Clone)]
//! struct APIError(String);
//!
//! async fn batch_get_users(
//!     usernames: Vec<String>,
//! ) -> Result<Vec<Result<UserData, APIError>>, APIError> {
//!     // A real implementation would make a single API request here. An
//!     // `Err` for the whole call rejects every username in it; an `Err` at
//!     // one position rejects just that username.
//!     Ok(usernames
//!         .into_iter()
//!         .map(|username| Ok(UserData { username }))
//!         .collect())
//! }
//! ```
//!
//! Next, create a [`Scheduler`] and a [`Loader`]. The scheduler owns the
//! batching window: every key requested before it next dispatches ends up in
//! the same batch call. It also runs the batch calls, and keeps going until
//! every request has settled, even when batch functions make requests of
//! their own to other loaders.
//!
//! ```
//! use batchloader::{Loader, Scheduler};
//! # #[derive(Debug, Clone, PartialEq)] struct UserData { username: String }
//! # #[derive(Debug, Clone, PartialEq)] struct APIError(String);
//! # async fn batch_get_users(usernames: Vec<String>)
//! #     -> Result<Vec<Result<UserData, APIError>>, APIError> {
//! #     Ok(usernames.into_iter().map(|username| Ok(UserData { username })).collect())
//! # }
//!
//! let scheduler = Scheduler::new();
//! let users = Loader::new(&scheduler, batch_get_users);
//!
//! let alice = users.load("alice".to_string());
//! let bob = users.load("bob".to_string());
//!
//! // Both requests are dispatched together in a single call to
//! // batch_get_users.
//! let (alice, bob) = scheduler
//!     .block_on(async move { (alice.await, bob.await) })
//!     .unwrap();
//!
//! assert_eq!(alice.unwrap().username, "alice");
//! assert_eq!(bob.unwrap().username, "bob");
//! ```
//!
//! Loaders can be configured with [`LoaderOptions`]: batching and caching can
//! each be disabled, batch calls can be limited to a maximum number of keys,
//! keys can be normalized with a custom cache key function, and the cache
//! itself can be replaced with any [`CacheMap`].
//!
//! ```
//! use batchloader::{Loader, LoaderOptions, Scheduler};
//!
//! #[derive(Debug, Clone)]
//! struct UserQuery {
//!     id: u64,
//!     trace_id: u64,
//! }
//!
//! let scheduler = Scheduler::new();
//!
//! // Queries with the same id are the same request, whatever their trace_id.
//! let options = LoaderOptions::keyed_by(|query: &UserQuery| query.id).with_max_batch_size(100);
//!
//! let users = Loader::with_options(&scheduler, options, |queries: Vec<UserQuery>| async move {
//!     let names: Vec<Result<String, String>> = queries
//!         .iter()
//!         .map(|query| Ok(format!("user {}", query.id)))
//!         .collect();
//!     Ok(names)
//! });
//!
//! let first = users.load(UserQuery { id: 1, trace_id: 10 });
//! let second = users.load(UserQuery { id: 1, trace_id: 20 });
//! assert!(first.ptr_eq(&second));
//!
//! assert_eq!(scheduler.wait(second).unwrap(), "user 1");
//! ```
//!
//! ## Design notes
//!
//! ### Batch functions return positional results
//!
//! A batch function receives its keys in the order they were requested, and
//! returns its results in the same order. Each result is independent: a
//! per-key error rejects only that key's request, and is cached like any other
//! result. If the whole call fails, or returns the wrong number of results,
//! every request in that call is rejected and evicted from the cache, so that
//! it can be retried.
//!
//! ### Scheduler-driven design
//!
//! A [`LoadFuture`] does no work when polled; it only observes the result of
//! its request. All work happens in the [`Scheduler`], which runs the awaited
//! future and every in-flight batch call as tasks on a single-threaded pool.
//! Whenever those tasks can't make any more progress, the scheduler visits
//! its loaders in creation order and dispatches each one that has queued
//! keys. This is what makes the batching window deterministic: a batch is
//! dispatched only once everything that could still add keys to it has run.
//!
//! Each loader belongs to exactly one scheduler, rather than a process-wide
//! registry. When a loader is dropped, requests it hasn't dispatched yet are
//! rejected with [`LoadError::Disposed`], rather than being left to hang.

mod batch;
mod cache;
mod error;
mod future;
mod loader;
mod options;
mod scheduler;
mod wakerset;

pub use batch::BatchResult;
pub use cache::CacheMap;
pub use error::{AwaitError, LoadError, SchedulerError};
pub use future::LoadFuture;
pub use loader::Loader;
pub use options::LoaderOptions;
pub use scheduler::{LoaderId, Scheduler};
