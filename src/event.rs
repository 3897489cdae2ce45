// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    context::{Context, Request},
    error::{Error, Result},
};
use psys_sys::ipu_psys_event;
use std::time::Instant;
use tracing::{trace, warn};

/// Default completion timeout in milliseconds.
pub const EVENT_TIMEOUT_MS: u64 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    pub event_type: u32,
    pub user_token: u64,
    pub issue_id: u64,
    pub buffer_idx: u32,
    /// Error reported by the firmware for the completed command.
    pub error: u32,
    pub timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            event_type: 0,
            user_token: 0,
            issue_id: 0,
            buffer_idx: 0,
            error: 0,
            timeout_ms: EVENT_TIMEOUT_MS,
        }
    }
}

/// One completion slot.
#[derive(Debug, Default)]
pub struct Event {
    config: EventConfig,
}

impl Event {
    pub fn new(config: EventConfig) -> Self {
        Event { config }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EventConfig) {
        self.config = config;
    }

    /// Waits for one completion and dequeues it.
    ///
    /// A completion carrying a firmware error is not an error here; the
    /// caller inspects [`EventConfig::error`].
    pub fn wait(&mut self, context: &Context) -> Result<()> {
        let start = Instant::now();
        let timeout = i32::try_from(self.config.timeout_ms).unwrap_or(i32::MAX);
        let ready = context
            .poller(libc::POLLIN | libc::POLLHUP | libc::POLLERR, timeout)
            .poll()?;
        if ready == 0 {
            return Err(Error::Timeout(self.config.timeout_ms));
        }

        let mut event = ipu_psys_event {
            user_token: self.config.user_token,
            issue_id: self.config.issue_id,
            ..Default::default()
        };
        context.do_ioctl(Request::DequeueEvent(&mut event))?;

        self.config.event_type = event.type_;
        self.config.user_token = event.user_token;
        self.config.issue_id = event.issue_id;
        self.config.buffer_idx = event.buffer_idx;
        self.config.error = event.error;

        if self.config.error != 0 {
            warn!(
                "command {} completed with error {}",
                self.config.issue_id, self.config.error
            );
        }
        trace!("event after {:?}", start.elapsed());
        Ok(())
    }
}
