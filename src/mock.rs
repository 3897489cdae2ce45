// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-process stand-ins for the psys driver and the parameter codec.

use crate::{
    bitmap::{KernelBitmap, RoutingBitmap},
    codec::{CodecConfig, ParameterCodec, Requirements, TerminalPayload, TerminalRequirement},
    context::{Driver, Request},
    error::Result,
    format::FrameFormatType,
    fragment::{fragment_starts, FragmentDesc},
    manifest::{tests::data_terminal, tests::param_terminal, ProgramGroupManifest, TerminalType},
    process_group::TOKEN_OFFSET,
};
use nix::errno::Errno;
use psys_sys::{
    ipu_psys_buffer, ipu_psys_buffer_base, ipu_psys_command, ipu_psys_event, IPU_BUFFER_FLAG_DMA_HANDLE,
    IPU_BUFFER_FLAG_USERPTR, IPU_PSYS_EVENT_TYPE_CMD_COMPLETE,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    os::fd::RawFd,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

/// Program group id of [`simple_manifest`].
pub const SIMPLE_PG: u32 = 100;

/// Manifest with one input, one output and three parameter terminals.
pub fn simple_manifest() -> ProgramGroupManifest {
    ProgramGroupManifest::new(
        SIMPLE_PG,
        (0..6).collect(),
        2,
        vec![
            param_terminal(0, TerminalType::ProgramControlInit, &[]),
            data_terminal(1, TerminalType::DataIn, &[0], 1024),
            param_terminal(2, TerminalType::ParamCachedIn, &[1, 2]),
            param_terminal(3, TerminalType::ParamSpatialIn, &[3]),
            param_terminal(4, TerminalType::Program, &[4]),
            data_terminal(5, TerminalType::DataOut, &[5], 1024),
        ],
    )
    .unwrap()
}

/// Manifest laid out like program group 189: temporal reference data
/// terminals at 4 and 6, simulation parameter terminals at 5 and 7.
pub fn tnr_manifest() -> ProgramGroupManifest {
    ProgramGroupManifest::new(
        189,
        (0..6).collect(),
        3,
        vec![
            param_terminal(0, TerminalType::ProgramControlInit, &[]),
            data_terminal(1, TerminalType::DataIn, &[0], 4096),
            param_terminal(2, TerminalType::ParamCachedIn, &[1]),
            data_terminal(3, TerminalType::DataOut, &[2], 4096),
            data_terminal(4, TerminalType::DataIn, &[3], 4096),
            param_terminal(5, TerminalType::ParamSpatialIn, &[4]),
            data_terminal(6, TerminalType::DataOut, &[3], 4096),
            param_terminal(7, TerminalType::ParamSpatialOut, &[4]),
        ],
    )
    .unwrap()
}

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: ipu_psys_command,
    pub buffers: Vec<ipu_psys_buffer>,
    /// Fragment state the process group carried when queued.
    pub fragment_state: u16,
    pub fragment_limit: u16,
    pub token: u64,
}

#[derive(Debug)]
struct State {
    dev_model: String,
    manifests: Vec<Vec<u8>>,
    next_fd: RawFd,
    next_token: u64,
    user_memory: HashMap<RawFd, (u64, u64)>,
    mapped: HashSet<RawFd>,
    closed: Vec<RawFd>,
    put: Vec<RawFd>,
    cancelled: Vec<u64>,
    queued: Vec<QueuedCommand>,
    events: VecDeque<ipu_psys_event>,
    hold_completions: bool,
    event_error: u32,
    fail_queue: Option<Errno>,
}

/// Driver emulating the psys character device.
#[derive(Debug, Clone)]
pub struct MockDriver {
    state: Arc<Mutex<State>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        MockDriver::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver::with_manifests(vec![simple_manifest()])
    }

    pub fn with_manifests(manifests: Vec<ProgramGroupManifest>) -> Self {
        MockDriver {
            state: Arc::new(Mutex::new(State {
                dev_model: "ipu6ep".to_owned(),
                manifests: manifests.iter().map(|m| m.as_bytes().to_vec()).collect(),
                next_fd: 1000,
                next_token: 0x7000,
                user_memory: HashMap::new(),
                mapped: HashSet::new(),
                closed: Vec::new(),
                put: Vec::new(),
                cancelled: Vec::new(),
                queued: Vec::new(),
                events: VecDeque::new(),
                hold_completions: false,
                event_error: 0,
                fail_queue: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_dev_model(&self, model: &str) {
        self.lock().dev_model = model.to_owned();
    }

    pub fn mapped_count(&self) -> usize {
        self.lock().mapped.len()
    }

    pub fn closed_handles(&self) -> Vec<RawFd> {
        self.lock().closed.clone()
    }

    /// Handles returned through PUTBUF, in order.
    pub fn put_handles(&self) -> Vec<RawFd> {
        self.lock().put.clone()
    }

    /// Issue ids of cancelled commands.
    pub fn cancelled(&self) -> Vec<u64> {
        self.lock().cancelled.clone()
    }

    pub fn queued(&self) -> Vec<QueuedCommand> {
        self.lock().queued.clone()
    }

    pub fn push_event(&self, event: ipu_psys_event) {
        self.lock().events.push_back(event);
    }

    /// Queued commands stop producing completions.
    pub fn hold_completions(&self, hold: bool) {
        self.lock().hold_completions = hold;
    }

    /// Error reported inside every following completion.
    pub fn set_event_error(&self, error: u32) {
        self.lock().event_error = error;
    }

    /// Makes every following QCMD fail with `errno`.
    pub fn fail_queue(&self, errno: Option<Errno>) {
        self.lock().fail_queue = errno;
    }

    fn queue(state: &mut State, command: &ipu_psys_command, buffers: &[ipu_psys_buffer]) -> nix::Result<()> {
        if let Some(errno) = state.fail_queue {
            return Err(errno);
        }

        let pg_fd = command.pg;
        let &(ptr, len) = state.user_memory.get(&pg_fd).ok_or(Errno::EINVAL)?;
        if (len as usize) < TOKEN_OFFSET + 8 {
            return Err(Errno::EINVAL);
        }
        // SAFETY: the process group buffer registered this memory through
        // GETBUF and stays alive while its command is queued.
        let pg = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) };
        let read_u16 = |at: usize| u16::from_le_bytes([pg[at], pg[at + 1]]);
        let (fragment_state, fragment_limit) = (read_u16(54), read_u16(56));

        let mut token = [0u8; 8];
        token.copy_from_slice(&pg[TOKEN_OFFSET..TOKEN_OFFSET + 8]);
        let mut token = u64::from_le_bytes(token);
        if token == 0 {
            token = state.next_token;
            state.next_token += 1;
            pg[TOKEN_OFFSET..TOKEN_OFFSET + 8].copy_from_slice(&token.to_le_bytes());
        }

        state.queued.push(QueuedCommand {
            command: *command,
            buffers: buffers.to_vec(),
            fragment_state,
            fragment_limit,
            token,
        });
        if !state.hold_completions {
            state.events.push_back(ipu_psys_event {
                type_: IPU_PSYS_EVENT_TYPE_CMD_COMPLETE,
                user_token: command.user_token,
                issue_id: command.issue_id,
                error: state.event_error,
                ..Default::default()
            });
        }
        Ok(())
    }
}

impl Driver for MockDriver {
    fn ioctl(&self, request: Request<'_>) -> nix::Result<()> {
        let mut state = self.lock();
        match request {
            Request::QueryCapability(cap) => {
                let mut driver = [0u8; 20];
                driver[..9].copy_from_slice(b"ipu6-psys");
                let mut dev_model = [0u8; 32];
                let model = state.dev_model.as_bytes();
                dev_model[..model.len()].copy_from_slice(model);
                cap.version = 1;
                cap.driver = driver;
                cap.dev_model = dev_model;
                cap.pg_count = state.manifests.len() as u32;
                Ok(())
            }
            Request::GetManifest {
                index,
                size,
                buffer,
            } => {
                let blob = state.manifests.get(index as usize).ok_or(Errno::ENOENT)?;
                if let Some(buffer) = buffer {
                    let n = buffer.len().min(blob.len());
                    buffer[..n].copy_from_slice(&blob[..n]);
                }
                *size = blob.len() as u32;
                Ok(())
            }
            Request::GetBuffer(buf) => {
                let flags = buf.flags;
                if flags & IPU_BUFFER_FLAG_USERPTR == 0 {
                    return Err(Errno::EINVAL);
                }
                let fd = state.next_fd;
                state.next_fd += 1;
                state.user_memory.insert(fd, (buf.userptr(), buf.len));
                buf.base = ipu_psys_buffer_base { fd };
                buf.flags = (flags & !IPU_BUFFER_FLAG_USERPTR) | IPU_BUFFER_FLAG_DMA_HANDLE;
                Ok(())
            }
            Request::PutBuffer(buf) => {
                let fd = buf.fd();
                state.user_memory.remove(&fd).ok_or(Errno::EINVAL)?;
                state.put.push(fd);
                Ok(())
            }
            Request::MapBuffer(fd) => {
                state.mapped.insert(fd);
                Ok(())
            }
            Request::UnmapBuffer(fd) => {
                if state.mapped.remove(&fd) {
                    Ok(())
                } else {
                    Err(Errno::EINVAL)
                }
            }
            Request::QueueCommand { command, buffers } => {
                MockDriver::queue(&mut state, command, buffers)
            }
            Request::DequeueEvent(event) => {
                *event = state.events.pop_front().ok_or(Errno::EAGAIN)?;
                Ok(())
            }
            Request::CancelCommand(command) => {
                let issue_id = command.issue_id;
                state.cancelled.push(issue_id);
                Ok(())
            }
        }
    }

    fn poll(&self, _events: i16, timeout_ms: i32) -> nix::Result<i32> {
        if !self.lock().events.is_empty() {
            return Ok(1);
        }
        if timeout_ms > 0 {
            thread::sleep(Duration::from_millis(timeout_ms as u64));
        }
        Ok(if self.lock().events.is_empty() { 0 } else { 1 })
    }

    fn close_handle(&self, fd: RawFd) -> nix::Result<()> {
        let mut state = self.lock();
        state.user_memory.remove(&fd);
        state.closed.push(fd);
        Ok(())
    }
}

/// What the fake codec was asked to do.
#[derive(Debug, Default)]
pub struct CodecLog {
    pub calls: Vec<&'static str>,
    pub config: Option<CodecConfig>,
    pub frame_formats: Vec<Option<FrameFormatType>>,
    /// Terminal indices handed to every `encode`.
    pub encoded: Vec<Vec<usize>>,
    /// Bytes found in every payload at `encode`, keyed by terminal.
    pub seen: Vec<Vec<(usize, u8)>>,
}

/// Parameter codec that sizes payloads from a fixed table.
#[derive(Debug, Clone)]
pub struct FakeCodec {
    payload_sizes: Vec<u32>,
    kernel_bitmap: KernelBitmap,
    frames: u8,
    pub log: Arc<Mutex<CodecLog>>,
}

impl FakeCodec {
    /// `payload_sizes` is indexed by manifest terminal.
    pub fn new(payload_sizes: Vec<u32>) -> Self {
        FakeCodec {
            payload_sizes,
            kernel_bitmap: KernelBitmap::FULL,
            frames: 0,
            log: Arc::new(Mutex::new(CodecLog::default())),
        }
    }

    pub fn log(&self) -> MutexGuard<'_, CodecLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ParameterCodec for FakeCodec {
    fn init(&mut self, config: &CodecConfig) -> Result<()> {
        let mut log = self.log();
        log.calls.push("init");
        log.config = Some(config.clone());
        Ok(())
    }

    fn prepare(
        &mut self,
        _parameters: &[u8],
        _routing: &RoutingBitmap,
        frame_formats: &[Option<FrameFormatType>],
    ) -> Result<Requirements> {
        let mut log = self.log();
        log.calls.push("prepare");
        log.frame_formats = frame_formats.to_vec();
        Ok(Requirements {
            kernel_bitmap: self.kernel_bitmap,
            terminals: self
                .payload_sizes
                .iter()
                .map(|&payload_size| TerminalRequirement {
                    section_count: u32::from(payload_size > 0),
                    payload_size,
                    ..Default::default()
                })
                .collect(),
            max_stats_size: 64,
        })
    }

    fn fragment_descriptors(&mut self, fragment_count: u32) -> Result<Vec<Vec<FragmentDesc>>> {
        let mut log = self.log();
        log.calls.push("fragment_descriptors");
        let Some(config) = &log.config else {
            return Ok(Vec::new());
        };
        let frame = config.input_main_frame.unwrap_or_default();
        let manifest = &config.manifest;

        let mut out = Vec::with_capacity(manifest.terminal_count());
        for terminal in &manifest.terminals {
            let Some(data) = terminal.data.filter(|_| terminal.terminal_type.is_data()) else {
                out.push(Vec::new());
                continue;
            };
            let max = u32::from(data.max_fragment_width());
            let starts = if fragment_count > 1 {
                fragment_starts(frame.width, max, crate::fragment::FRAGMENT_OVERLAP)?
            } else {
                vec![0]
            };
            out.push(
                starts
                    .iter()
                    .take(fragment_count as usize)
                    .map(|&x| FragmentDesc {
                        width: frame.width.saturating_sub(x).min(max) as u16,
                        height: frame.height as u16,
                        start_x: x as u16,
                        start_y: 0,
                    })
                    .collect(),
            );
        }
        Ok(out)
    }

    fn encode(&mut self, _parameters: &[u8], payloads: &mut [TerminalPayload<'_>]) -> Result<()> {
        self.frames = self.frames.wrapping_add(1);
        let mut log = self.log();
        log.calls.push("encode");
        log.encoded.push(payloads.iter().map(|p| p.terminal).collect());
        log.seen.push(
            payloads
                .iter()
                .map(|p| (p.terminal, p.data.first().copied().unwrap_or(0)))
                .collect(),
        );
        for payload in payloads.iter_mut() {
            if let Some(first) = payload.data.first_mut() {
                *first = self.frames;
            }
        }
        Ok(())
    }

    fn decode(
        &mut self,
        payloads: &mut [TerminalPayload<'_>],
        statistics: &mut Vec<u8>,
    ) -> Result<()> {
        self.log().calls.push("decode");
        statistics.clear();
        statistics.extend(payloads.iter().map(|p| p.terminal as u8));
        Ok(())
    }

    fn deinit(&mut self) {
        self.log().calls.push("deinit");
    }
}
