//! A tiny message-passing event loop.
//!
//! State lives in one place and is only ever mutated on the loop itself.
//! Sources feed messages in, handlers look at each message (and a shared
//! reference to the state) and may respond with more messages or with
//! futures whose output is marshalled back onto the loop once they resolve.
//!
//! For every message the loop runs, in order:
//! 1. [`Message::preprocess`] with a shared reference to the state
//! 2. every handler, each seeing the state *before* this message is applied
//! 3. [`Message::update_state`]
//! 4. any follow-up messages produced by the handlers, depth first

use std::{collections::VecDeque, future::Future, marker::PhantomData, pin::Pin, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, Receiver, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

pub type BoxedFuture<M> = Pin<Box<dyn Future<Output = Option<M>> + Send>>;

// Traits *************************

pub trait Message<S>: Sized {
    #[allow(unused_variables)]
    fn update_state(self, state: &mut S) {}

    #[allow(unused_variables)]
    fn preprocess(&mut self, state: &S) {}
}

/// Implemented by the combined message enum generated by [`define_messages`].
pub trait StateUpdater<S> {
    fn update_state(self, state: &mut S);
    fn preprocess(&mut self, state: &S);
}

pub trait Is<T>: From<T> {
    fn try_get(&self) -> Option<&T>;
}

pub fn try_get<T>(message: &impl Is<T>) -> Option<&T> {
    message.try_get()
}

pub trait MessageHandler<S, IM, OM> {
    fn handle_message(&mut self, state: &S, message: &IM) -> Option<Handled<OM>>;
}

/// Implemented by the combined handler enum generated by [`define_handlers`].
pub trait HandlerStruct<S, M> {
    fn handle_message(&mut self, state: &S, message: &M) -> Option<Handled<M>>;
}

pub trait MessageSource<M> {
    fn next_message(&mut self) -> Option<M>;
}

impl<M, T: Into<M>> MessageSource<M> for Receiver<T> {
    fn next_message(&mut self) -> Option<M> {
        self.try_recv().ok().map(Into::into)
    }
}

impl<M, T: Into<M>> MessageSource<M> for UnboundedReceiver<T> {
    fn next_message(&mut self) -> Option<M> {
        self.try_recv().ok().map(Into::into)
    }
}

// Handled *************************

pub enum Handled<M> {
    Single(M),
    Future(BoxedFuture<M>),
    Multiple(Vec<Handled<M>>),
}

impl<M> Handled<M> {
    #[must_use]
    pub const fn none() -> Option<Self> {
        None
    }

    pub fn single(message: impl Into<M>) -> Option<Self> {
        Some(Self::Single(message.into()))
    }

    pub fn future(fut: impl Future<Output = Option<M>> + Send + 'static) -> Option<Self> {
        Some(Self::Future(Box::pin(fut)))
    }

    pub fn multiple(handled: impl IntoIterator<Item = Option<Self>>) -> Option<Self> {
        let handled: Vec<Self> = handled.into_iter().flatten().collect();
        if handled.is_empty() {
            return None;
        }
        Some(Self::Multiple(handled))
    }

    fn flatten_into(self, out: &mut Vec<Action<M>>) {
        match self {
            Self::Single(m) => out.push(Action::Message(m)),
            Self::Future(f) => out.push(Action::Future(f)),
            Self::Multiple(many) => many.into_iter().for_each(|h| h.flatten_into(out)),
        }
    }
}

pub enum Action<M> {
    Message(M),
    Future(BoxedFuture<M>),
}

// EventLoop *************************

pub struct EventLoop<S, M, H> {
    sources: Vec<Box<dyn MessageSource<M> + Send>>,
    handlers: Vec<H>,

    completed_tx: UnboundedSender<Option<M>>,
    completed_rx: UnboundedReceiver<Option<M>>,
    tasks: Vec<JoinHandle<()>>,

    _state: PhantomData<fn(&mut S)>,
}

impl<S, M, H> EventLoop<S, M, H>
where
    M: StateUpdater<S> + Send + 'static,
    H: HandlerStruct<S, M>,
{
    #[must_use]
    pub fn new() -> Self {
        let (completed_tx, completed_rx) = unbounded_channel();
        Self {
            sources: Vec::new(),
            handlers: Vec::new(),
            completed_tx,
            completed_rx,
            tasks: Vec::new(),
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn add_source(mut self, source: Box<dyn MessageSource<M> + Send>) -> Self {
        self.sources.push(source);
        self
    }

    #[must_use]
    pub fn add_handler(mut self, handler: impl Into<H>) -> Self {
        self.handlers.push(handler.into());
        self
    }

    /// Number of spawned futures that have not completed yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Runs a single message through the handlers and applies it to the
    /// state. Returns whatever the handlers asked for without acting on it.
    pub fn handle_message(&mut self, mut message: M, state: &mut S) -> Vec<Action<M>> {
        message.preprocess(state);

        let mut actions = Vec::new();
        for handler in &mut self.handlers {
            if let Some(handled) = handler.handle_message(state, &message) {
                handled.flatten_into(&mut actions);
            }
        }

        message.update_state(state);
        actions
    }

    /// Drains every source and every completed future, handling each message
    /// and any follow-up messages they cause. Returns `None` if there was
    /// nothing to do.
    pub async fn execute_cycle(&mut self, state: &mut S) -> Option<()> {
        let mut queue: VecDeque<M> = VecDeque::new();

        for source in &mut self.sources {
            while let Some(m) = source.next_message() {
                queue.push_back(m);
            }
        }

        while let Ok(completed) = self.completed_rx.try_recv() {
            if let Some(m) = completed {
                queue.push_back(m);
            }
        }

        if queue.is_empty() {
            self.tasks.retain(|t| !t.is_finished());
            return None;
        }

        while let Some(message) = queue.pop_front() {
            let actions = self.handle_message(message, state);
            for action in actions.into_iter().rev() {
                match action {
                    Action::Message(m) => queue.push_front(m),
                    Action::Future(f) => self.spawn(f),
                }
            }
        }

        tokio::task::yield_now().await;
        Some(())
    }

    /// Waits for in-flight futures to finish, aborting whatever is still
    /// running once `grace` has elapsed.
    pub async fn shutdown(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        let tasks = std::mem::take(&mut self.tasks);
        let mut aborted = 0;

        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            tracing::debug!("Aborted {aborted} pending tasks on shutdown.");
        }
    }

    fn spawn(&mut self, fut: BoxedFuture<M>) {
        self.tasks.retain(|t| !t.is_finished());

        let tx = self.completed_tx.clone();
        self.tasks.push(tokio::task::spawn(async move {
            // The loop may already be gone during shutdown
            let _ = tx.send(fut.await);
        }));
    }
}

impl<S, M, H> Default for EventLoop<S, M, H>
where
    M: StateUpdater<S> + Send + 'static,
    H: HandlerStruct<S, M>,
{
    fn default() -> Self {
        Self::new()
    }
}

// Macros *************************

#[macro_export]
macro_rules! define_messages {
    ($name:ident<$state:ty>: $($message:ident),* $(,)?) => {
        pub enum $name {
            None,
            $($message($message),)*
        }

        $(
            impl From<$message> for $name {
                fn from(m: $message) -> Self {
                    Self::$message(m)
                }
            }

            impl $crate::Is<$message> for $name {
                #[allow(unreachable_patterns)]
                fn try_get(&self) -> Option<&$message> {
                    match self {
                        Self::$message(m) => Some(m),
                        _ => None,
                    }
                }
            }
        )*

        impl $crate::StateUpdater<$state> for $name {
            fn update_state(self, state: &mut $state) {
                match self {
                    Self::None => {}
                    $(Self::$message(m) => $crate::Message::<$state>::update_state(m, state),)*
                }
            }

            fn preprocess(&mut self, state: &$state) {
                match self {
                    Self::None => {}
                    $(Self::$message(m) => $crate::Message::<$state>::preprocess(m, state),)*
                }
            }
        }
    };
}

#[macro_export]
macro_rules! define_handlers {
    ($name:ident<$state:ty, $message:ty>: $($handler:ident),* $(,)?) => {
        pub enum $name {
            $($handler($handler),)*
        }

        $(
            impl From<$handler> for $name {
                fn from(h: $handler) -> Self {
                    Self::$handler(h)
                }
            }
        )*

        impl $crate::HandlerStruct<$state, $message> for $name {
            fn handle_message(
                &mut self,
                state: &$state,
                message: &$message,
            ) -> Option<$crate::Handled<$message>> {
                match self {
                    $(Self::$handler(h) => $crate::MessageHandler::<$state, $message, $message>::handle_message(h, state, message),)*
                }
            }
        }
    };
}

#[macro_export]
macro_rules! define_events {
    (
        $state:ty,
        $message:ident { $($m:ident),* $(,)? },
        $handler:ident { $($h:ident),* $(,)? } $(,)?
    ) => {
        $crate::define_messages!($message<$state>: $($m),*);
        $crate::define_handlers!($handler<$state, $message>: $($h),*);
    };
}
