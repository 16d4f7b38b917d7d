use std::collections::VecDeque;
use std::net::IpAddr;

use log::trace;
use parking_lot::Mutex;

use super::{Contact, Id};

/// Bounded FIFO of contacts waiting for a `find_node` probe.
///
/// Shared between the receive thread (push) and the drain thread (pop). Full pools
/// drop new contacts instead of blocking the producer.
pub struct NodePool {
    capacity: usize,
    local_ip: IpAddr,
    local_id: Id,
    queue: Mutex<VecDeque<Contact>>,
}

impl NodePool {
    pub fn new(capacity: usize, local_ip: IpAddr, local_id: Id) -> Self {
        NodePool {
            capacity,
            local_ip,
            local_id,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns false if the contact was not admitted.
    pub fn try_push(&self, contact: Contact) -> bool {
        if contact.address.port() == 0 {
            trace!("rejecting {:?}: port zero", contact);
            return false;
        }
        if contact.address.ip() == self.local_ip || contact.id == self.local_id {
            trace!("rejecting {:?}: that's us", contact);
            return false;
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(contact);
        true
    }

    pub fn pop_front(&self) -> Option<Contact> {
        self.queue.lock().pop_front()
    }

    /// Snapshot only, another thread may push right after.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
