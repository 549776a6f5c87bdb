//! Bounded transfer pool.
//!
//! Given N work items and a pool of P = min(concurrent requests, N), at most
//! P tasks run at once. The first failure parks itself in a shared cell; the
//! scheduler stops handing out new work and tasks that were already queued
//! observe the cell at entry and return immediately. The caller always waits
//! for in-flight tasks to drain and then receives that first error once.

use std::{
	future::Future,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::error;

use crate::error::{Error, Result};

pub(crate) async fn run<T, F, Fut>(items: Vec<T>, pool_size: usize, task: F) -> Result<()>
where
	T: Send + 'static,
	F: Fn(T, usize, usize) -> Fut,
	Fut: Future<Output = Result<()>> + Send + 'static,
{
	if items.is_empty() {
		return Ok(());
	}

	let total = items.len();
	let pool_size = pool_size.clamp(1, total);
	let semaphore = Arc::new(Semaphore::new(pool_size));
	let first_error: Arc<Mutex<Option<Error>>> = Arc::default();
	let seq = Arc::new(AtomicUsize::new(0));
	let mut tasks = JoinSet::new();

	for item in items {
		if first_error.lock().unwrap().is_some() {
			break; // stop scheduling, drain what is already in flight
		}

		let permit = semaphore
			.clone()
			.acquire_owned()
			.await
			.expect("transfer semaphore never closes");
		let fut = task(item, seq.fetch_add(1, Ordering::SeqCst) + 1, total);
		let first_error = first_error.clone();

		tasks.spawn(async move {
			let _permit = permit;
			if first_error.lock().unwrap().is_some() {
				return; // fail fast
			}
			if let Err(e) = fut.await {
				let mut slot = first_error.lock().unwrap();
				if slot.is_none() {
					*slot = Some(e);
				}
			}
		});
	}

	while let Some(joined) = tasks.join_next().await {
		if let Err(e) = joined {
			error!("transfer task panicked: {e}");
		}
	}

	let result = match first_error.lock().unwrap().take() {
		Some(e) => Err(e),
		None => Ok(()),
	};
	result
}
