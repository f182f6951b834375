//! The task-based data store API.
//!
//! Facade calls never touch the store directly: each operation is captured as
//! a [`StoreRequest`], queued to the engine-owned worker thread, and completed
//! through a oneshot channel wrapped in a [`Task`]. User values cross the
//! boundary as JSON objects; typed (de)serialization happens on the caller's
//! side, so the worker stays type-erased.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use peersync_core::{JsonObject, ObjectKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::engine::EngineShared;
use crate::error::{Result, StoreError};
use crate::setup;
use crate::store::{DataEvent, LocalStore};

/// A user type storable through the facade.
///
/// The associated name is the stable type identifier records are filed
/// under; `object_id` extracts the record id from a value on save.
pub trait StoreObject: Serialize + DeserializeOwned + Send + 'static {
    /// Stable type identifier, e.g. `"Note"`.
    const TYPE_NAME: &'static str;

    /// The record id of this value.
    fn object_id(&self) -> String;
}

/// Type-erased result of a store operation.
#[derive(Debug)]
pub(crate) enum RawReply {
    Unit,
    Bool(bool),
    Count(u64),
    Keys(Vec<String>),
    Json(JsonObject),
    JsonList(Vec<JsonObject>),
}

pub(crate) type ReplySender = oneshot::Sender<Result<RawReply>>;

/// One operation queued to the store worker.
pub(crate) enum StoreRequest {
    Count { type_name: String, reply: ReplySender },
    Keys { type_name: String, reply: ReplySender },
    LoadAll { type_name: String, reply: ReplySender },
    Load { key: ObjectKey, reply: ReplySender },
    Save { key: ObjectKey, data: JsonObject, reply: ReplySender },
    Remove { key: ObjectKey, reply: ReplySender },
    Search { type_name: String, pattern: String, reply: ReplySender },
    Clear { type_name: String, reply: ReplySender },
    Reset { reply: ReplySender },
    Shutdown,
}

impl StoreRequest {
    fn fail(self, err: StoreError) {
        match self {
            StoreRequest::Count { reply, .. }
            | StoreRequest::Keys { reply, .. }
            | StoreRequest::LoadAll { reply, .. }
            | StoreRequest::Load { reply, .. }
            | StoreRequest::Save { reply, .. }
            | StoreRequest::Remove { reply, .. }
            | StoreRequest::Search { reply, .. }
            | StoreRequest::Clear { reply, .. }
            | StoreRequest::Reset { reply } => {
                let _ = reply.send(Err(err));
            }
            StoreRequest::Shutdown => {}
        }
    }
}

/// The engine-owned worker loop: executes requests one at a time until the
/// queue closes or a shutdown request arrives.
pub(crate) fn run_store_worker(
    store: &LocalStore,
    shared: &EngineShared,
    mut requests: mpsc::UnboundedReceiver<StoreRequest>,
) {
    while let Some(request) = requests.blocking_recv() {
        if matches!(request, StoreRequest::Shutdown) {
            break;
        }
        execute(store, shared, request);
    }
}

fn execute(store: &LocalStore, shared: &EngineShared, request: StoreRequest) {
    if shared.is_fatal() {
        request.fail(StoreError::Fatal(shared.fatal_message()));
        return;
    }
    match request {
        StoreRequest::Count { type_name, reply } => {
            finish(shared, reply, store.count(&type_name).map(RawReply::Count));
        }
        StoreRequest::Keys { type_name, reply } => {
            finish(shared, reply, store.keys(&type_name).map(RawReply::Keys));
        }
        StoreRequest::LoadAll { type_name, reply } => {
            finish(
                shared,
                reply,
                store.load_all(&type_name).map(RawReply::JsonList),
            );
        }
        StoreRequest::Load { key, reply } => {
            finish(shared, reply, store.load(&key).map(RawReply::Json));
        }
        StoreRequest::Save { key, data, reply } => {
            finish(shared, reply, store.save(&key, &data).map(|()| RawReply::Unit));
        }
        StoreRequest::Remove { key, reply } => {
            finish(shared, reply, store.remove(&key).map(RawReply::Bool));
        }
        StoreRequest::Search {
            type_name,
            pattern,
            reply,
        } => {
            finish(
                shared,
                reply,
                store.find(&type_name, &pattern).map(RawReply::JsonList),
            );
        }
        StoreRequest::Clear { type_name, reply } => {
            finish(shared, reply, store.clear(&type_name).map(|()| RawReply::Unit));
        }
        StoreRequest::Reset { reply } => {
            finish(shared, reply, store.reset().map(|()| RawReply::Unit));
        }
        StoreRequest::Shutdown => {}
    }
}

fn finish(shared: &EngineShared, reply: ReplySender, result: Result<RawReply>) {
    if let Err(StoreError::Fatal(message)) = &result {
        shared.enter_fatal(message);
    }
    let _ = reply.send(result);
}

/// Completion handle of a facade operation.
///
/// Awaitable from any async context; `wait` blocks the calling thread
/// instead. Once dispatched the operation runs to completion whether or not
/// the task is polled.
pub struct Task<T> {
    rx: oneshot::Receiver<Result<RawReply>>,
    convert: fn(RawReply) -> Result<T>,
}

impl<T> Task<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<RawReply>>, convert: fn(RawReply) -> Result<T>) -> Self {
        Self { rx, convert }
    }

    /// A task that completes immediately with `result`.
    pub(crate) fn ready(result: Result<RawReply>, convert: fn(RawReply) -> Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, convert)
    }

    /// Blocks the calling thread until the operation completes.
    ///
    /// Must not be called from an async context; `await` the task there.
    ///
    /// # Errors
    ///
    /// Whatever the operation failed with, or [`StoreError::Fatal`] when the
    /// engine stopped before completing it.
    pub fn wait(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(Ok(raw)) => (self.convert)(raw),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(engine_stopped()),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(Ok(raw))) => Poll::Ready((this.convert)(raw)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(engine_stopped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn engine_stopped() -> StoreError {
    StoreError::Fatal("engine stopped before completing the request".to_string())
}

fn reply_mismatch(reply: &RawReply) -> StoreError {
    StoreError::Fatal(format!("mismatched store reply: {reply:?}"))
}

pub(crate) fn as_unit(raw: RawReply) -> Result<()> {
    match raw {
        RawReply::Unit => Ok(()),
        other => Err(reply_mismatch(&other)),
    }
}

fn as_bool(raw: RawReply) -> Result<bool> {
    match raw {
        RawReply::Bool(value) => Ok(value),
        other => Err(reply_mismatch(&other)),
    }
}

fn as_count(raw: RawReply) -> Result<u64> {
    match raw {
        RawReply::Count(value) => Ok(value),
        other => Err(reply_mismatch(&other)),
    }
}

fn as_keys(raw: RawReply) -> Result<Vec<String>> {
    match raw {
        RawReply::Keys(value) => Ok(value),
        other => Err(reply_mismatch(&other)),
    }
}

fn from_object<T: DeserializeOwned>(object: JsonObject) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|err| StoreError::Serialization(err.to_string()))
}

fn as_typed<T: DeserializeOwned>(raw: RawReply) -> Result<T> {
    match raw {
        RawReply::Json(object) => from_object(object),
        other => Err(reply_mismatch(&other)),
    }
}

fn as_typed_list<T: DeserializeOwned>(raw: RawReply) -> Result<Vec<T>> {
    match raw {
        RawReply::JsonList(objects) => objects.into_iter().map(from_object).collect(),
        other => Err(reply_mismatch(&other)),
    }
}

/// Asynchronous access to one engine's record store.
///
/// Handles are cheap to create and clone-free to use from any thread; every
/// operation returns a [`Task`].
pub struct AsyncDataStore {
    requests: mpsc::UnboundedSender<StoreRequest>,
    events: broadcast::Sender<DataEvent>,
}

impl AsyncDataStore {
    /// Opens a handle to the default setup.
    ///
    /// # Errors
    ///
    /// [`StoreError::SetupNotFound`] when the default setup was not created.
    pub fn new() -> Result<Self> {
        Self::for_setup(setup::DEFAULT_SETUP)
    }

    /// Opens a handle to a named setup.
    ///
    /// # Errors
    ///
    /// [`StoreError::SetupNotFound`] when no such setup exists.
    pub fn for_setup(name: &str) -> Result<Self> {
        let engine =
            setup::Setup::engine(name).ok_or_else(|| StoreError::SetupNotFound(name.to_string()))?;
        Ok(Self {
            requests: engine.request_sender(),
            events: engine.data_sender(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        requests: mpsc::UnboundedSender<StoreRequest>,
        events: broadcast::Sender<DataEvent>,
    ) -> Self {
        Self { requests, events }
    }

    /// Counts the stored records of `T`.
    pub fn count<T: StoreObject>(&self) -> Task<u64> {
        self.submit(
            |reply| StoreRequest::Count {
                type_name: T::TYPE_NAME.to_string(),
                reply,
            },
            as_count,
        )
    }

    /// Lists all record ids of `T`.
    pub fn keys<T: StoreObject>(&self) -> Task<Vec<String>> {
        self.submit(
            |reply| StoreRequest::Keys {
                type_name: T::TYPE_NAME.to_string(),
                reply,
            },
            as_keys,
        )
    }

    /// Loads every record of `T`.
    pub fn load_all<T: StoreObject>(&self) -> Task<Vec<T>> {
        self.submit(
            |reply| StoreRequest::LoadAll {
                type_name: T::TYPE_NAME.to_string(),
                reply,
            },
            as_typed_list::<T>,
        )
    }

    /// Loads the record of `T` with the given id.
    pub fn load<T: StoreObject>(&self, id: &str) -> Task<T> {
        self.submit(
            |reply| StoreRequest::Load {
                key: ObjectKey::new(T::TYPE_NAME, id),
                reply,
            },
            as_typed::<T>,
        )
    }

    /// Saves a record; creates or overwrites by its id.
    pub fn save<T: StoreObject>(&self, value: &T) -> Task<()> {
        let data = match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(object)) => object,
            Ok(_) => {
                return Task::ready(
                    Err(StoreError::Serialization(
                        "value did not serialize to a JSON object".to_string(),
                    )),
                    as_unit,
                )
            }
            Err(err) => {
                return Task::ready(Err(StoreError::Serialization(err.to_string())), as_unit)
            }
        };
        let key = ObjectKey::new(T::TYPE_NAME, value.object_id());
        self.submit(|reply| StoreRequest::Save { key, data, reply }, as_unit)
    }

    /// Removes the record of `T` with the given id; resolves to whether a
    /// record existed.
    pub fn remove<T: StoreObject>(&self, id: &str) -> Task<bool> {
        self.submit(
            |reply| StoreRequest::Remove {
                key: ObjectKey::new(T::TYPE_NAME, id),
                reply,
            },
            as_bool,
        )
    }

    /// Searches the ids of `T` with a glob pattern (`*` any run, `?` one
    /// character) and loads the matches.
    pub fn search<T: StoreObject>(&self, pattern: &str) -> Task<Vec<T>> {
        self.submit(
            |reply| StoreRequest::Search {
                type_name: T::TYPE_NAME.to_string(),
                pattern: pattern.to_string(),
                reply,
            },
            as_typed_list::<T>,
        )
    }

    /// Drops every record of `T`; the clear propagates to other devices.
    pub fn clear<T: StoreObject>(&self) -> Task<()> {
        self.submit(
            |reply| StoreRequest::Clear {
                type_name: T::TYPE_NAME.to_string(),
                reply,
            },
            as_unit,
        )
    }

    /// Subscribes to change and reset notifications of the backing store.
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(ReplySender) -> StoreRequest,
        convert: fn(RawReply) -> Result<T>,
    ) -> Task<T> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(build(tx)).is_err() {
            return Task::ready(Err(engine_stopped()), convert);
        }
        Task::new(rx, convert)
    }
}
