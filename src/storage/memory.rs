//! In-process message storage

use super::{MsgStorage, StatusCounts};
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{Message, MsgId, MsgStatus, Receipt, Request, Response};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Message storage backed by a sharded concurrent map
#[derive(Default)]
pub struct MemoryStorage {
    msgs: DashMap<MsgId, Message>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    fn with_msg<T>(
        &self,
        id: &MsgId,
        f: impl FnOnce(&mut Message) -> DeliveryResult<T>,
    ) -> DeliveryResult<T> {
        let mut msg = self
            .msgs
            .get_mut(id)
            .ok_or(DeliveryError::MsgNotFound(*id))?;
        f(msg.value_mut())
    }
}

#[async_trait]
impl MsgStorage for MemoryStorage {
    async fn add_msg(&self, request: Request) -> DeliveryResult<()> {
        let id = request.id;
        match self.msgs.entry(id) {
            Entry::Occupied(_) => Err(DeliveryError::DuplicateMsg(id)),
            Entry::Vacant(slot) => {
                slot.insert(Message::new(request));
                debug!(%id, "Stored message");
                Ok(())
            }
        }
    }

    async fn get_msg(&self, id: &MsgId) -> DeliveryResult<Message> {
        self.msgs
            .get(id)
            .map(|m| m.clone())
            .ok_or(DeliveryError::MsgNotFound(*id))
    }

    async fn update_msg(&self, msg: Message) -> DeliveryResult<()> {
        let id = msg.id();
        self.with_msg(&id, |stored| {
            *stored = msg;
            stored.touch();
            Ok(())
        })
    }

    async fn update_response(&self, response: Response) -> DeliveryResult<()> {
        let id = response.id;
        self.with_msg(&id, |msg| {
            msg.set_response(response);
            Ok(())
        })
    }

    async fn update_receipt(&self, receipt: Receipt) -> DeliveryResult<()> {
        let id = receipt.id;
        self.with_msg(&id, |msg| {
            msg.set_receipt(receipt);
            Ok(())
        })
    }

    async fn update_msg_status(&self, id: &MsgId, status: MsgStatus) -> DeliveryResult<()> {
        self.with_msg(id, |msg| msg.set_status(status))
    }

    async fn has_msg(&self, id: &MsgId) -> DeliveryResult<bool> {
        Ok(self.msgs.contains_key(id))
    }

    async fn status_counts(&self) -> DeliveryResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.msgs.iter() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }
}
