//! Reference-counted resource cache
//!
//! Caches resources keyed by `u64` on behalf of a [`ResourceLoader`], which
//! supplies the miss path (`load`) and the eviction path (`writeback`). A
//! resource stays resident while at least one caller holds a reference and is
//! written back as soon as the last reference is released.
//!
//! A key is always in exactly one of three states: absent, in flight (being
//! loaded or written back) or resident. In-flight keys occupy a capacity slot,
//! and callers asking for an in-flight key block until it settles.

use crate::Config;
use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::collections::hash_map;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Supplies and persists the resources held by a [`ResourceCache`].
pub trait ResourceLoader: Send + Sync {
	type Resource: Send + Sync;

	/// Produce the resource for `key` on a cache miss.
	///
	/// Called without the cache lock held. An error is handed back to the
	/// caller of [`ResourceCache::get`] unchanged.
	fn load(&self, key: u64) -> DbResult<Self::Resource>;

	/// Persist or dispose of a resource that is leaving the cache.
	///
	/// Best-effort: failures are the loader's own concern.
	fn writeback(&self, resource: &Self::Resource);
}

/// A resident resource
struct Entry<T> {
	value: Arc<T>,
	refs: usize,
}

/// Bookkeeping guarded by the cache lock
struct CacheState<T> {
	entries: HashMap<u64, Entry<T>>,
	/// Keys being loaded or written back, each with the signal its waiters block on
	in_flight: HashMap<u64, Arc<Condvar>>,
	/// Resident plus in-flight keys
	count: usize,
}

/// Statistics for the resource cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
	/// Maximum number of resources (0 = unbounded).
	pub capacity: usize,
	/// Number of resident resources.
	pub resident: usize,
	/// Number of keys being loaded or written back.
	pub in_flight: usize,
	/// Gets served from a resident entry.
	pub hits: u64,
	/// Gets that invoked the loader.
	pub misses: u64,
	/// Resources written back.
	pub writebacks: u64,
	/// Gets rejected with `CacheFull`.
	pub rejections: u64,
}

/// Bounded, reference-counted cache in front of a [`ResourceLoader`]
pub struct ResourceCache<L: ResourceLoader> {
	loader: L,
	state: Mutex<CacheState<L::Resource>>,
	max_resources: usize,
	hits: AtomicU64,
	misses: AtomicU64,
	writebacks: AtomicU64,
	rejections: AtomicU64,
}

impl<L: ResourceLoader> ResourceCache<L> {
	/// Create a cache holding at most `max_resources` resources.
	///
	/// A limit of 0 makes the cache unbounded.
	pub fn new(loader: L, max_resources: usize) -> Self {
		Self {
			loader,
			state: Mutex::new(CacheState {
				entries: HashMap::new(),
				in_flight: HashMap::new(),
				count: 0,
			}),
			max_resources,
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			writebacks: AtomicU64::new(0),
			rejections: AtomicU64::new(0),
		}
	}

	/// Create a cache without a resource limit
	pub fn unbounded(loader: L) -> Self {
		Self::new(loader, 0)
	}

	/// Create a cache sized by `config.cache_max_resources`
	pub fn with_config(loader: L, config: &Config) -> Self {
		Self::new(loader, config.cache_max_resources)
	}

	/// Get a shared handle to the resource for `key`, loading it on a miss.
	///
	/// Every successful call must be paired with exactly one
	/// [`release`](Self::release) of the same key.
	///
	/// Fails with [`DbError::CacheFull`] when the cache is bounded and every
	/// slot is taken; in that case nothing is changed. A load error is
	/// returned as-is after the reserved slot has been freed again.
	pub fn get(&self, key: u64) -> DbResult<Arc<L::Resource>> {
		let mut state = self.state.lock();
		loop {
			if let Some(signal) = state.in_flight.get(&key).cloned() {
				trace!(key, "Waiting for in-flight resource");
				signal.wait(&mut state);
				continue;
			}

			if let Some(entry) = state.entries.get_mut(&key) {
				entry.refs += 1;
				self.hits.fetch_add(1, Ordering::Relaxed);
				return Ok(Arc::clone(&entry.value));
			}

			if self.max_resources > 0 && state.count >= self.max_resources {
				self.rejections.fetch_add(1, Ordering::Relaxed);
				debug!(key, capacity = self.max_resources, "Resource cache full");
				return Err(DbError::CacheFull);
			}

			state.count += 1;
			state.in_flight.insert(key, Arc::new(Condvar::new()));
			break;
		}
		drop(state);

		self.misses.fetch_add(1, Ordering::Relaxed);
		let slot = InFlightSlot { cache: self, key, armed: true };

		// An error (or a panic) drops the slot, which frees the reservation
		let value = Arc::new(self.loader.load(key)?);
		slot.complete(Arc::clone(&value));

		trace!(key, "Loaded resource");
		Ok(value)
	}

	/// Like [`get`](Self::get), but returns a guard that releases the key when dropped.
	pub fn get_guard(&self, key: u64) -> DbResult<CacheGuard<'_, L>> {
		let value = self.get(key)?;
		Ok(CacheGuard {
			cache: self,
			key,
			value,
		})
	}

	/// Drop one reference to `key`.
	///
	/// When the last reference goes away the resource is written back and its
	/// slot is freed. Releasing a key that is not resident is an error and
	/// leaves the cache untouched.
	pub fn release(&self, key: u64) -> DbResult<()> {
		let value = {
			let mut state = self.state.lock();
			let mut occupied = match state.entries.entry(key) {
				hash_map::Entry::Occupied(occupied) => occupied,
				hash_map::Entry::Vacant(_) => {
					return Err(DbError::InvalidOperation(format!(
						"Release of non-resident key {key}"
					)));
				}
			};

			occupied.get_mut().refs -= 1;
			if occupied.get().refs > 0 {
				return Ok(());
			}

			let entry = occupied.remove();
			state.in_flight.insert(key, Arc::new(Condvar::new()));
			entry.value
		};

		// Keeps the key in flight until the write-back is finished
		let _slot = InFlightSlot { cache: self, key, armed: true };
		self.loader.writeback(&value);
		self.writebacks.fetch_add(1, Ordering::Relaxed);

		trace!(key, "Wrote back resource");
		Ok(())
	}

	/// Write back and forget every resident resource, whatever its reference count.
	///
	/// Meant for shutdown: callers must stop issuing `get`/`release` first.
	pub fn close(&self) {
		let drained: Vec<(u64, Entry<L::Resource>)> = {
			let mut state = self.state.lock();
			let drained: Vec<_> = state.entries.drain().collect();
			state.count -= drained.len();
			drained
		};

		let closed = drained.len();
		for (key, entry) in drained {
			if entry.refs > 0 {
				debug!(key, refs = entry.refs, "Writing back referenced resource on close");
			}
			self.loader.writeback(&entry.value);
			self.writebacks.fetch_add(1, Ordering::Relaxed);
		}

		info!(resources = closed, "Resource cache closed");
	}

	/// Check whether `key` is resident
	pub fn contains(&self, key: u64) -> bool {
		self.state.lock().entries.contains_key(&key)
	}

	/// Number of resident resources
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resource limit (0 = unbounded)
	pub fn capacity(&self) -> usize {
		self.max_resources
	}

	pub fn loader(&self) -> &L {
		&self.loader
	}

	/// Get cache statistics
	pub fn stats(&self) -> CacheStats {
		let state = self.state.lock();
		CacheStats {
			capacity: self.max_resources,
			resident: state.entries.len(),
			in_flight: state.in_flight.len(),
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			writebacks: self.writebacks.load(Ordering::Relaxed),
			rejections: self.rejections.load(Ordering::Relaxed),
		}
	}
}

/// Capacity slot held by an in-flight key.
///
/// Dropping an armed slot frees the slot and wakes the key's waiters.
struct InFlightSlot<'a, L: ResourceLoader> {
	cache: &'a ResourceCache<L>,
	key: u64,
	armed: bool,
}

impl<L: ResourceLoader> InFlightSlot<'_, L> {
	/// Install a loaded value; the slot now belongs to the resident entry.
	fn complete(mut self, value: Arc<L::Resource>) {
		self.armed = false;
		let mut state = self.cache.state.lock();
		state.entries.insert(self.key, Entry { value, refs: 1 });
		if let Some(signal) = state.in_flight.remove(&self.key) {
			signal.notify_all();
		}
	}
}

impl<L: ResourceLoader> Drop for InFlightSlot<'_, L> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let mut state = self.cache.state.lock();
		state.count -= 1;
		if let Some(signal) = state.in_flight.remove(&self.key) {
			signal.notify_all();
		}
	}
}

/// Handle to a cached resource that releases its reference on drop
pub struct CacheGuard<'a, L: ResourceLoader> {
	cache: &'a ResourceCache<L>,
	key: u64,
	value: Arc<L::Resource>,
}

impl<L: ResourceLoader> CacheGuard<'_, L> {
	pub fn key(&self) -> u64 {
		self.key
	}

	/// The shared handle, for callers that need to keep it past the guard
	pub fn value(&self) -> &Arc<L::Resource> {
		&self.value
	}
}

impl<L: ResourceLoader> Deref for CacheGuard<'_, L> {
	type Target = L::Resource;

	fn deref(&self) -> &Self::Target {
		&self.value
	}
}

impl<L: ResourceLoader> Drop for CacheGuard<'_, L> {
	fn drop(&mut self) {
		if let Err(e) = self.cache.release(self.key) {
			warn!(key = self.key, error = %e, "Failed to release cache guard");
		}
	}
}
