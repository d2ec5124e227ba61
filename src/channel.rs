use crate::event_loop::EventLoop;
use crate::event_loop::Resource;
use bitflags::bitflags;
use mio::Interest;
use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Instant;

bitflags! {
    /// Interest and readiness bits carried by a [`Channel`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct EventMask: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const ERROR = 0b0100;
        const HUP = 0b1000;
    }
}

impl EventMask {
    /// Converts a readiness event reported by the poll backend.
    ///
    /// A peer half-close comes with read readiness and drains through the
    /// read path (zero read); only a bare hangup maps to HUP alone.
    pub(crate) fn from_mio(event: &mio::event::Event) -> EventMask {
        let mut mask = EventMask::empty();
        if event.is_readable() || event.is_priority() {
            mask |= EventMask::READ;
        }
        if event.is_writable() {
            mask |= EventMask::WRITE;
        }
        if event.is_error() {
            mask |= EventMask::ERROR;
        }
        if event.is_read_closed() && event.is_write_closed() {
            mask |= EventMask::HUP;
        }
        mask
    }

    /// Converts the interest bits to a registration interest, if any.
    pub(crate) fn interest(self) -> Option<Interest> {
        let mut interest = None;
        if self.contains(EventMask::READ) {
            interest = Some(Interest::READABLE);
        }
        if self.contains(EventMask::WRITE) {
            interest = Some(match interest {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

/// Registration state of a channel inside the poller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChannelState {
    /// Never registered.
    New,
    /// Registered with the kernel.
    Added,
    /// Known to the poller but deregistered (empty interest mask).
    Deleted,
}

// Wrapper types for the per-event callback slots.
pub type ReadEventCallback = Box<dyn FnMut(Instant) + 'static>;
pub type EventCallback = Box<dyn FnMut() + 'static>;

/// Binds one file descriptor to an interest mask and per-event callbacks.
///
/// A channel never owns its fd and is only ever touched from the thread of
/// its owning [`EventLoop`]. Whoever created the channel (acceptor,
/// connector, connection, timer queue) must disable it and call [`remove`]
/// before closing the fd.
///
/// [`remove`]: Channel::remove
pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    events: Cell<EventMask>,
    revents: Cell<EventMask>,
    state: Cell<ChannelState>,
    handling: Cell<bool>,
    tied: RefCell<Option<Weak<dyn Resource>>>,
    on_read: RefCell<Option<ReadEventCallback>>,
    on_write: RefCell<Option<EventCallback>>,
    on_close: RefCell<Option<EventCallback>>,
    on_error: RefCell<Option<EventCallback>>,
    self_ref: RefCell<Weak<Channel>>,
}

impl Channel {
    /// Creates a new channel over `fd`, owned by `event_loop`.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        let channel = Rc::new(Channel {
            owner: Rc::downgrade(event_loop),
            fd,
            events: Cell::new(EventMask::empty()),
            revents: Cell::new(EventMask::empty()),
            state: Cell::new(ChannelState::New),
            handling: Cell::new(false),
            tied: RefCell::new(None),
            on_read: RefCell::new(None),
            on_write: RefCell::new(None),
            on_close: RefCell::new(None),
            on_error: RefCell::new(None),
            self_ref: RefCell::new(Weak::new()),
        });
        *channel.self_ref.borrow_mut() = Rc::downgrade(&channel);
        channel
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> EventMask {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: EventMask) {
        self.revents.set(revents);
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.set(state);
    }

    pub(crate) fn weak_ref(&self) -> Weak<Channel> {
        self.self_ref.borrow().clone()
    }

    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: FnMut(Instant) + 'static,
    {
        *self.on_read.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.on_write.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.on_close.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.on_error.borrow_mut() = Some(Box::new(callback));
    }

    /// Ties the channel to the resource that owns it.
    ///
    /// Before any callback fires the weak reference is promoted to a strong
    /// one; if the owner is already gone the whole dispatch is skipped.
    pub fn tie(&self, owner: &Rc<dyn Resource>) {
        *self.tied.borrow_mut() = Some(Rc::downgrade(owner));
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events.get().contains(EventMask::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.events.get().contains(EventMask::WRITE)
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | EventMask::READ);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | EventMask::WRITE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.set(self.events.get() - EventMask::WRITE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(EventMask::empty());
        self.update();
    }

    /// Unregisters the channel from its loop's poller.
    ///
    /// The interest mask must be empty; call [`disable_all`] first.
    ///
    /// [`disable_all`]: Channel::disable_all
    pub fn remove(&self) {
        assert!(self.is_none_event());
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(&self) {
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Routes the returned-events mask to the installed callbacks.
    ///
    /// Exactly one callback pass per call; re-entry on the same channel is
    /// a no-op.
    pub fn handle_event(&self, receive_time: Instant) {
        if self.handling.get() {
            return;
        }
        let tied = self.tied.borrow().clone();
        match tied {
            Some(owner) => match owner.upgrade() {
                // Keep the owner alive for the duration of the dispatch.
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => log::trace!("channel fd={} owner is gone, skipping dispatch", self.fd),
            },
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.handling.set(true);
        let revents = self.revents.get();
        log::trace!("channel fd={} revents={:?}", self.fd, revents);

        // A hangup without pending input means the peer is gone for good;
        // with input pending the read path observes the zero-read instead.
        if revents.contains(EventMask::HUP) && !revents.contains(EventMask::READ) {
            log::warn!("channel fd={} hung up", self.fd);
            self.invoke(&self.on_close);
        }
        if revents.contains(EventMask::ERROR) {
            self.invoke(&self.on_error);
        }
        if revents.contains(EventMask::READ) {
            let callback = self.on_read.borrow_mut().take();
            if let Some(mut callback) = callback {
                callback(receive_time);
                self.restore(&self.on_read, callback);
            }
        }
        if revents.contains(EventMask::WRITE) {
            self.invoke(&self.on_write);
        }
        self.handling.set(false);
    }

    // Callbacks run with their slot taken out, so they are free to replace
    // or drop themselves; the original is restored only into an empty slot.
    fn invoke(&self, slot: &RefCell<Option<EventCallback>>) {
        let callback = slot.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback();
            self.restore(slot, callback);
        }
    }

    fn restore<T>(&self, slot: &RefCell<Option<T>>, callback: T) {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_conversion() {
        assert!(EventMask::empty().interest().is_none());
        assert_eq!(EventMask::READ.interest(), Some(Interest::READABLE));
        assert_eq!(EventMask::WRITE.interest(), Some(Interest::WRITABLE));
        assert_eq!(
            (EventMask::READ | EventMask::WRITE).interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn mask_updates() {
        let mut mask = EventMask::empty();
        mask |= EventMask::READ;
        mask |= EventMask::WRITE;
        assert!(mask.contains(EventMask::READ | EventMask::WRITE));
        mask -= EventMask::WRITE;
        assert!(!mask.contains(EventMask::WRITE));
        assert!(mask.contains(EventMask::READ));
    }
}
