use crate::channel::Channel;
use crate::channel::ChannelState;
use crate::channel::EventMask;
use mio::unix::SourceFd;
use mio::Events;
use mio::Poll;
use mio::Token;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;
use std::time::Instant;

/// How many readiness events a single poll call can report.
const EVENTS_CAPACITY: usize = 1024;

/// Owns the multiplexing backend and the per-fd channel registration state.
///
/// Only the owning loop's thread ever touches a poller. Registration uses an
/// epoll-style three-state machine: channels with an empty interest mask stay
/// known to the poller but are deregistered from the kernel, so re-enabling
/// and final removal stay cheap.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl Poller {
    pub fn new() -> Poller {
        Poller {
            poll: Poll::new().expect("failed to create poll instance"),
            events: Events::with_capacity(EVENTS_CAPACITY),
            channels: HashMap::new(),
        }
    }

    /// Waits for readiness, fills `active` and returns the wakeup instant.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<Channel>>) -> Instant {
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            // Signal interruptions are routine; anything else is reported
            // and the loop keeps going.
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("poll failed: {err}");
            }
        }
        let now = Instant::now();
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let channel = match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => channel,
                None => continue,
            };
            let revents = EventMask::from_mio(event);
            if revents.is_empty() {
                continue;
            }
            channel.set_revents(revents);
            active.push(channel);
        }
        if !active.is_empty() {
            log::trace!("{} channels ready", active.len());
        }
        now
    }

    /// Inserts a new channel or refreshes the interest mask of a known one.
    pub fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                if channel.state() == ChannelState::New {
                    assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel.weak_ref());
                } else {
                    assert!(self.channels.contains_key(&fd));
                }
                if let Some(interest) = channel.events().interest() {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(fd as usize), interest)
                        .expect("failed to register channel");
                    channel.set_state(ChannelState::Added);
                }
            }
            ChannelState::Added => match channel.events().interest() {
                Some(interest) => {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                        .expect("failed to reregister channel");
                }
                None => {
                    self.poll
                        .registry()
                        .deregister(&mut SourceFd(&fd))
                        .expect("failed to deregister channel");
                    channel.set_state(ChannelState::Deleted);
                }
            },
        }
    }

    /// Forgets a disabled channel.
    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        assert!(channel.is_none_event());
        let removed = self.channels.remove(&fd);
        debug_assert!(removed.is_some());
        if channel.state() == ChannelState::Added {
            self.poll
                .registry()
                .deregister(&mut SourceFd(&fd))
                .expect("failed to deregister channel");
        }
        channel.set_state(ChannelState::New);
    }
}
