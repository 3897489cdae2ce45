// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Lifecycle of one process group on the psys device.
//!
//! A [`ProcessGroupController`] is configured in three steps. [`init`]
//! queries the device and finds the manifest of the program group,
//! [`prepare`] asks the codec what every terminal needs and builds the
//! process group and its buffers, and [`iterate`] runs one frame. The first
//! frame starts the persistent process group on the firmware, after which
//! every frame is submitted once per fragment against the token the start
//! command returned.
//!
//! [`init`]: ProcessGroupController::init
//! [`prepare`]: ProcessGroupController::prepare
//! [`iterate`]: ProcessGroupController::iterate

use crate::{
    bitmap::{KernelBitmap, RoutingBitmap},
    buffer::Buffer,
    codec::{prune_dead_terminals, CodecConfig, MainFrame, ParameterCodec, Requirements, TerminalPayload},
    command::{Command, CommandConfig, CommandExt, COMMAND_EXT_SIZE},
    context::{Context, Platform},
    error::{Error, Result},
    event::{Event, EventConfig, EVENT_TIMEOUT_MS},
    format::{self, align_64, FourCC, FrameFormatType},
    fragment::{fragment_count, terminal_descriptors, FRAGMENT_OVERLAP},
    frame::{FrameBuffer, FrameInfo, FrameMemory},
    manifest::ProgramGroupManifest,
    memory::{MemoryDesc, MemoryFlags},
    process_group::{read_token, FrameParams, ProcessGroup, PROTOCOL_PPG},
    refer_pool::{refer_id, ReferId, SharedReferencePool},
};
use psys_sys::{IPU_PSYS_CMD_PRIORITY_MED, IPU_PSYS_DEVICE};
use std::{
    collections::{BTreeMap, HashMap},
    os::fd::RawFd,
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, info, instrument, trace, warn};

/// Buffers cycled through a locally managed reference pair.
const PAIR_BUFFER_COUNT: usize = 2;

/// Rows of the temporal noise reduction reference are padded to this.
const TNR_HEIGHT_ALIGN: u32 = 32;

/// Program group running temporal noise reduction.
pub const PG_ID_TNR: u32 = 189;
/// Program group running digital video stabilisation.
pub const PG_ID_DVS: u32 = 187;

/// Terminals whose output of one frame is the input of the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalPair {
    pub input: usize,
    pub output: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    /// Temporal noise reduction reference frame.
    Tnr,
    /// Temporal noise reduction similarity payload.
    TnrSim,
    /// Digital video stabilisation payloads.
    Dvs,
}

const fn pair(input: usize, output: usize) -> TerminalPair {
    TerminalPair { input, output }
}

static TNR_PAIRS: [TerminalPair; 1] = [pair(4, 6)];
static TNR_SIM_PAIRS: [TerminalPair; 1] = [pair(5, 7)];
static DVS_PAIRS: [TerminalPair; 3] = [pair(21, 24), pair(22, 25), pair(23, 26)];

/// Reference terminal pairs of a program group.
pub fn terminal_pairs(pg_id: u32, kind: PairKind) -> &'static [TerminalPair] {
    match (pg_id, kind) {
        (PG_ID_TNR, PairKind::Tnr) => &TNR_PAIRS,
        (PG_ID_TNR, PairKind::TnrSim) => &TNR_SIM_PAIRS,
        (PG_ID_DVS, PairKind::Dvs) => &DVS_PAIRS,
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Program group to run.
    pub pg_id: u32,
    /// Shows up in logs.
    pub name: String,
    /// Terminal uids handed to the controller are this plus the manifest
    /// terminal index.
    pub terminal_base_uid: u32,
    /// Stream the controller belongs to, used for shared references.
    pub stream_id: u32,
    pub event_timeout_ms: u64,
    pub fragment_overlap: u32,
    pub priority: u32,
    pub psys_frequency: u32,
    pub device: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            pg_id: 0,
            name: "pg".to_owned(),
            terminal_base_uid: 0,
            stream_id: 0,
            event_timeout_ms: EVENT_TIMEOUT_MS,
            fragment_overlap: FRAGMENT_OVERLAP,
            priority: IPU_PSYS_CMD_PRIORITY_MED,
            psys_frequency: 0,
            device: PathBuf::from(IPU_PSYS_DEVICE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    /// Device and manifest are known.
    CapabilityKnown,
    /// Process group and buffers exist, nothing submitted yet.
    Prepared,
    /// The persistent process group runs on the firmware.
    Running,
    Deinitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKey {
    Fd(RawFd),
    Addr(usize),
}

#[derive(Debug)]
struct Registration {
    key: FrameKey,
    buffer: Arc<Buffer>,
}

/// Commands of a started persistent process group.
#[derive(Debug)]
struct Submission {
    frame: Command,
    frame_ext: Arc<Buffer>,
    stop: Command,
    stop_ext: Arc<Buffer>,
    ppg_buffer: Arc<Buffer>,
    token: u64,
}

pub struct ProcessGroupController {
    config: ControllerConfig,
    state: State,
    context: Arc<Context>,
    codec: Box<dyn ParameterCodec>,
    codec_ready: bool,
    platform: Option<Platform>,
    manifest: Option<ProgramGroupManifest>,
    frame_infos: BTreeMap<usize, FrameInfo>,
    frame_formats: Vec<Option<FrameFormatType>>,
    input_main: Option<usize>,
    output_main: Option<usize>,
    disabled: Vec<usize>,
    routing: Option<RoutingBitmap>,
    pool: Option<Arc<SharedReferencePool>>,
    tnr: Option<TerminalPair>,
    tnr_sim: Vec<TerminalPair>,
    dvs: Vec<TerminalPair>,
    fragment_count: u32,
    kernel_bitmap: KernelBitmap,
    requirements: Requirements,
    process_group: Option<ProcessGroup>,
    /// Position of each manifest terminal in the process group.
    terminal_positions: Vec<Option<usize>>,
    pg_buffer: Option<Arc<Buffer>>,
    manifest_buffer: Option<Arc<Buffer>>,
    /// Indexed by manifest terminal.
    terminal_buffers: Vec<Option<Arc<Buffer>>>,
    reference_buffers: Vec<Arc<Buffer>>,
    shared: HashMap<usize, ReferId>,
    registrations: Vec<Registration>,
    submission: Option<Submission>,
    event: Event,
}

impl std::fmt::Debug for ProcessGroupController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroupController")
            .field("name", &self.config.name)
            .field("pg_id", &self.config.pg_id)
            .field("state", &self.state)
            .field("fragment_count", &self.fragment_count)
            .finish()
    }
}

impl ProcessGroupController {
    /// Creates a controller on the device named by `config`. Failing to
    /// open the device is reported by [`init`](Self::init).
    pub fn new(config: ControllerConfig, codec: Box<dyn ParameterCodec>) -> Self {
        let context = Arc::new(Context::open(&config.device));
        Self::with_context(config, context, codec)
    }

    pub fn with_context(
        config: ControllerConfig,
        context: Arc<Context>,
        codec: Box<dyn ParameterCodec>,
    ) -> Self {
        let event = Event::new(EventConfig {
            timeout_ms: config.event_timeout_ms,
            ..Default::default()
        });
        ProcessGroupController {
            config,
            state: State::Unconfigured,
            context,
            codec,
            codec_ready: false,
            platform: None,
            manifest: None,
            frame_infos: BTreeMap::new(),
            frame_formats: Vec::new(),
            input_main: None,
            output_main: None,
            disabled: Vec::new(),
            routing: None,
            pool: None,
            tnr: None,
            tnr_sim: Vec::new(),
            dvs: Vec::new(),
            fragment_count: 1,
            kernel_bitmap: KernelBitmap::EMPTY,
            requirements: Requirements::default(),
            process_group: None,
            terminal_positions: Vec::new(),
            pg_buffer: None,
            manifest_buffer: None,
            terminal_buffers: Vec::new(),
            reference_buffers: Vec::new(),
            shared: HashMap::new(),
            registrations: Vec::new(),
            submission: None,
            event,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn platform(&self) -> Option<Platform> {
        self.platform
    }

    pub fn manifest(&self) -> Option<&ProgramGroupManifest> {
        self.manifest.as_ref()
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Kernels enabled after pruning.
    pub fn kernel_bitmap(&self) -> KernelBitmap {
        self.kernel_bitmap
    }

    pub fn process_group(&self) -> Option<&ProcessGroup> {
        self.process_group.as_ref()
    }

    /// Manifest index of the largest input frame.
    pub fn input_main_terminal(&self) -> Option<usize> {
        self.input_main
    }

    pub fn output_main_terminal(&self) -> Option<usize> {
        self.output_main
    }

    /// Position of manifest terminal `index` inside the prepared process
    /// group; `None` for terminals the group leaves out.
    pub fn terminal_position(&self, index: usize) -> Option<usize> {
        self.terminal_positions.get(index).copied().flatten()
    }

    /// Buffer currently bound to a manifest terminal.
    pub fn terminal_buffer(&self, index: usize) -> Option<Arc<Buffer>> {
        self.terminal_buffers.get(index).cloned().flatten()
    }

    /// Token the firmware assigned when the process group was started.
    pub fn token(&self) -> Option<u64> {
        self.submission.as_ref().map(|s| s.token)
    }

    /// Number of caller frames currently registered with the device.
    pub fn registered_frame_count(&self) -> usize {
        self.registrations.len()
    }

    fn expect_state(&self, want: State, operation: &str) -> Result<()> {
        if self.state != want {
            return Err(Error::InvalidArg(format!(
                "{} on {} in state {:?}",
                operation, self.config.name, self.state
            )));
        }
        Ok(())
    }

    /// Queries the device and loads the manifest of the configured program
    /// group.
    #[instrument(skip_all, fields(pg = self.config.pg_id))]
    pub fn init(&mut self) -> Result<()> {
        self.expect_state(State::Unconfigured, "init")?;
        if !self.context.is_initialized() {
            return Err(Error::Device(format!(
                "psys device {} is not open",
                self.config.device.display()
            )));
        }

        let capability = self.context.capabilities()?;
        info!(
            "{} on {} ({}), {} program groups",
            self.config.name, capability.driver, capability.dev_model, capability.pg_count
        );
        self.platform = Some(capability.platform()?);

        let manifest = self.find_manifest(capability.pg_count)?;
        let count = manifest.terminal_count();
        let fits = |p: &&TerminalPair| {
            let fits = p.input < count && p.output < count;
            if !fits {
                warn!("reference pair {:?} outside {} terminals", p, count);
            }
            fits
        };
        let pg_id = self.config.pg_id;
        self.tnr = terminal_pairs(pg_id, PairKind::Tnr).iter().find(fits).copied();
        self.tnr_sim = terminal_pairs(pg_id, PairKind::TnrSim).iter().filter(fits).copied().collect();
        self.dvs = terminal_pairs(pg_id, PairKind::Dvs).iter().filter(fits).copied().collect();

        self.frame_formats = vec![None; count];
        self.terminal_buffers = vec![None; count];
        self.manifest = Some(manifest);
        self.state = State::CapabilityKnown;
        Ok(())
    }

    fn find_manifest(&self, pg_count: u32) -> Result<ProgramGroupManifest> {
        for index in 0..pg_count {
            let size = match self.context.manifest(index, None) {
                Ok(size) => size,
                Err(e) => {
                    debug!("skipping manifest {}: {}", index, e);
                    continue;
                }
            };
            if size == 0 {
                return Err(Error::Protocol(format!("manifest {} is empty", index)));
            }

            let mut blob = vec![0u8; size as usize];
            self.context.manifest(index, Some(&mut blob))?;
            let manifest = ProgramGroupManifest::parse(&blob)?;
            trace!("manifest {} is program group {}", index, manifest.id);
            if manifest.id == self.config.pg_id {
                debug!(
                    "program group {}: {} terminals, {} programs",
                    manifest.id,
                    manifest.terminal_count(),
                    manifest.program_count
                );
                return Ok(manifest);
            }
        }
        Err(Error::NoEntry(format!(
            "program group {} not found",
            self.config.pg_id
        )))
    }

    fn terminal_index(&self, uid: u32) -> Result<usize> {
        let count = self.terminal_buffers.len();
        uid.checked_sub(self.config.terminal_base_uid)
            .map(|i| i as usize)
            .filter(|&i| i < count)
            .ok_or_else(|| {
                Error::InvalidArg(format!(
                    "terminal uid {} outside {}..{}",
                    uid,
                    self.config.terminal_base_uid,
                    self.config.terminal_base_uid as usize + count
                ))
            })
    }

    /// Records the frames bound to input terminals, keyed by terminal uid.
    /// The largest becomes the main input and sizes the temporal noise
    /// reduction reference.
    pub fn set_input_info(&mut self, infos: &BTreeMap<u32, FrameInfo>) -> Result<()> {
        self.expect_state(State::CapabilityKnown, "set_input_info")?;
        self.input_main = self.record_frame_infos(infos)?;

        if let (Some(main), Some(pair)) = (self.input_main, self.tnr) {
            if let Some(main) = self.frame_infos.get(&main).copied() {
                let height = main.height.div_ceil(TNR_HEIGHT_ALIGN) * TNR_HEIGHT_ALIGN;
                let reference = FrameInfo::new(main.width, height, FourCC::NV12);
                debug!("temporal reference {}", reference);
                self.frame_infos.insert(pair.input, reference);
                self.frame_infos.insert(pair.output, reference);
            }
        }
        Ok(())
    }

    /// Records the frames bound to output terminals, keyed by terminal uid.
    pub fn set_output_info(&mut self, infos: &BTreeMap<u32, FrameInfo>) -> Result<()> {
        self.expect_state(State::CapabilityKnown, "set_output_info")?;
        self.output_main = self.record_frame_infos(infos)?;
        Ok(())
    }

    fn record_frame_infos(&mut self, infos: &BTreeMap<u32, FrameInfo>) -> Result<Option<usize>> {
        let mut main = None;
        let mut largest = 0;
        for (&uid, info) in infos {
            let index = self.terminal_index(uid)?;
            debug!("terminal {} frame {}", index, info);
            self.frame_infos.insert(index, *info);
            if info.area() > largest {
                largest = info.area();
                main = Some(index);
            }
        }
        Ok(main)
    }

    /// Data terminals the caller leaves unconnected, by uid.
    pub fn set_disabled_terminals(&mut self, uids: &[u32]) -> Result<()> {
        self.expect_state(State::CapabilityKnown, "set_disabled_terminals")?;
        self.disabled = uids
            .iter()
            .map(|&uid| self.terminal_index(uid))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// An empty bitmap leaves routing unset.
    pub fn set_routing_bitmap(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.routing = Some(RoutingBitmap::from_bytes(bytes));
    }

    pub fn set_shared_reference_pool(&mut self, pool: Arc<SharedReferencePool>) {
        self.pool = Some(pool);
    }

    /// Builds the process group for `parameters` and allocates every buffer
    /// the controller owns.
    #[instrument(skip_all, fields(pg = self.config.pg_id))]
    pub fn prepare(&mut self, parameters: &[u8]) -> Result<()> {
        self.expect_state(State::CapabilityKnown, "prepare")?;
        let manifest = self
            .manifest
            .clone()
            .ok_or_else(|| Error::Internal("no manifest".to_owned()))?;
        let platform = self
            .platform
            .ok_or_else(|| Error::Internal("no platform".to_owned()))?;

        for (&index, info) in &self.frame_infos {
            self.frame_formats[index] = format::frame_format(info.format);
        }
        self.fragment_count = self.calc_fragment_count(&manifest)?;

        let main_frame = |index: Option<usize>| {
            index
                .and_then(|i| self.frame_infos.get(&i))
                .map(|info| MainFrame {
                    width: info.width,
                    height: info.height,
                    bpe: u32::from(info.bpp()),
                })
        };
        let codec_config = CodecConfig {
            platform,
            manifest: manifest.clone(),
            fragment_count: self.fragment_count,
            disabled_data_terminals: self.disabled.clone(),
            input_main_frame: main_frame(self.input_main),
            output_main_frame: main_frame(self.output_main),
        };
        self.codec.init(&codec_config)?;
        self.codec_ready = true;

        let routing = self.routing.unwrap_or_default();
        let requirements = self.codec.prepare(parameters, &routing, &self.frame_formats)?;
        if requirements.terminals.len() != manifest.terminal_count() {
            return Err(Error::Protocol(format!(
                "codec sized {} terminals, manifest has {}",
                requirements.terminals.len(),
                manifest.terminal_count()
            )));
        }
        self.kernel_bitmap = prune_dead_terminals(
            requirements.kernel_bitmap,
            &manifest,
            &requirements.terminals,
            &self.disabled,
        );
        info!("kernel bitmap {}", self.kernel_bitmap);
        self.requirements = requirements;

        let fragments = u16::try_from(self.fragment_count)
            .map_err(|_| Error::InvalidArg(format!("{} fragments", self.fragment_count)))?;
        let mut pg = ProcessGroup::new(&manifest, self.kernel_bitmap, fragments)?;
        pg.num_queues = 1;
        pg.protocol_version = PROTOCOL_PPG;
        if let Some(routing) = self.routing {
            pg.routing_bitmap = routing;
        }
        self.terminal_positions = pg.terminal_map(manifest.terminal_count());
        for (index, position) in self.terminal_positions.iter().enumerate() {
            let Some(terminal) = position.and_then(|p| pg.terminals.get_mut(p)) else {
                continue;
            };
            if !terminal.terminal_type.is_data() {
                terminal.payload_size = self.requirements.terminals[index].payload_size;
                continue;
            }
            if let Some(info) = self.frame_infos.get(&index) {
                let bpp = info.bpp();
                terminal.frame = Some(FrameParams {
                    frame_format: self.frame_formats[index].map(|f| f as u8).unwrap_or(0),
                    bpp,
                    bpe: bpp,
                    width: dimension(info.width)?,
                    height: dimension(info.height)?,
                    stride: info.stride(),
                });
            }
        }
        self.configure_fragments(&mut pg)?;

        let pg_buffer = self.device_buffer(pg.size() as u32)?;
        pg.write_to(pg_buffer.map()?.as_mut_slice())?;
        debug!(
            "process group of {} bytes, {} terminals",
            pg.size(),
            pg.terminal_count()
        );
        self.pg_buffer = Some(pg_buffer);
        self.process_group = Some(pg);
        self.manifest_buffer = Some(manifest_buffer(&manifest)?);

        self.allocate_reference_frames()?;
        self.allocate_payloads(&manifest)?;
        self.state = State::Prepared;
        Ok(())
    }

    /// Largest fragment count any data terminal needs.
    fn calc_fragment_count(&self, manifest: &ProgramGroupManifest) -> Result<u32> {
        let mut count = 1;
        for (index, terminal) in manifest.terminals.iter().enumerate() {
            let Some(data) = terminal.data.filter(|_| terminal.terminal_type.is_data()) else {
                continue;
            };
            let Some(info) = self.frame_infos.get(&index) else {
                continue;
            };
            let max_width = align_64(u32::from(data.max_fragment_width()));
            count = count.max(fragment_count(
                info.width,
                max_width,
                self.config.fragment_overlap,
            )?);
        }
        debug!("{} fragments", count);
        Ok(count)
    }

    fn configure_fragments(&mut self, pg: &mut ProcessGroup) -> Result<()> {
        let count = self.fragment_count as usize;
        let descriptors = self.codec.fragment_descriptors(self.fragment_count)?;
        for (&index, info) in &self.frame_infos {
            let Some(terminal) = pg
                .terminal_mut(index)
                .filter(|t| t.terminal_type.is_data())
            else {
                continue;
            };
            let fragments = descriptors.get(index).map(Vec::as_slice).unwrap_or(&[]);
            if fragments.len() < count {
                return Err(Error::Protocol(format!(
                    "codec described {} fragments of terminal {}, need {}",
                    fragments.len(),
                    index,
                    count
                )));
            }
            terminal.fragments = terminal_descriptors(info.format, &fragments[..count]);
        }
        Ok(())
    }

    /// Zeroed host memory registered with the device.
    fn device_buffer(&self, size: u32) -> Result<Arc<Buffer>> {
        let buffer = Buffer::new(size, MemoryFlags::ALLOCATE_CPU_PTR | MemoryFlags::NO_FLUSH)?;
        buffer.attach_device(&self.context)?;
        Ok(buffer)
    }

    fn ext_buffer(&self) -> Result<Arc<Buffer>> {
        let buffer = Buffer::new(
            COMMAND_EXT_SIZE as u32,
            MemoryFlags::ALLOCATE_CPU_PTR | MemoryFlags::PSYS_API,
        )?;
        buffer.attach_device(&self.context)?;
        CommandExt::ppg(self.kernel_bitmap).write_to(buffer.map()?.as_mut_slice())?;
        Ok(buffer)
    }

    /// How many buffers a pair needs; registers the pair with the shared
    /// pool when the pool knows it.
    fn pair_buffer_count(&mut self, pair: TerminalPair) -> usize {
        let Some(pool) = &self.pool else {
            return PAIR_BUFFER_COUNT;
        };
        let id = refer_id(self.config.stream_id, self.config.pg_id, pair.input as u32);
        let min = pool.min_buffer_count(id);
        if min > 0 {
            debug!("terminal {} shares references as {:#x}", pair.input, id);
            self.shared.insert(pair.input, id);
        }
        PAIR_BUFFER_COUNT.max(min)
    }

    fn allocate_pair(&mut self, pair: TerminalPair, size: u32) -> Result<()> {
        let count = self.pair_buffer_count(pair);
        let shared = self.shared.get(&pair.input).copied();
        let pool = self.pool.clone();
        for slot in 0..count {
            let buffer = self.device_buffer(size)?;
            if let (Some(id), Some(pool)) = (shared, &pool) {
                pool.register_refer_buffer(id, buffer.clone())?;
            }
            match slot {
                0 => self.terminal_buffers[pair.input] = Some(buffer.clone()),
                1 => self.terminal_buffers[pair.output] = Some(buffer.clone()),
                _ => {}
            }
            self.reference_buffers.push(buffer);
        }
        trace!("{} buffers of {} bytes for {:?}", count, size, pair);
        Ok(())
    }

    fn allocate_reference_frames(&mut self) -> Result<()> {
        let Some(pair) = self.tnr else {
            return Ok(());
        };
        let Some(info) = self.frame_infos.get(&pair.input).copied() else {
            debug!("no temporal reference frame");
            return Ok(());
        };
        self.allocate_pair(pair, info.size())
    }

    fn allocate_payloads(&mut self, manifest: &ProgramGroupManifest) -> Result<()> {
        for pair in self.tnr_sim.clone() {
            let size = self.requirements.terminals[pair.input].payload_size;
            if size == 0 {
                debug!("terminal {} carries no similarity payload", pair.input);
                continue;
            }
            self.allocate_pair(pair, size)?;
        }

        for (index, terminal) in manifest.terminals.iter().enumerate() {
            let size = self.requirements.terminals[index].payload_size;
            if terminal.terminal_type.is_data() || size == 0 || self.terminal_buffers[index].is_some() {
                continue;
            }
            self.terminal_buffers[index] = Some(self.device_buffer(size)?);
        }
        Ok(())
    }

    /// Runs one frame.
    ///
    /// `inputs` and `outputs` map terminal uids to caller frames; a uid in
    /// both binds the input. The sequence of the first input tags the
    /// frame. Statistics are decoded when `statistics` is given.
    #[instrument(skip_all, fields(pg = self.config.pg_id))]
    pub fn iterate(
        &mut self,
        inputs: &BTreeMap<u32, FrameBuffer>,
        outputs: &BTreeMap<u32, FrameBuffer>,
        parameters: &[u8],
        statistics: Option<&mut Vec<u8>>,
    ) -> Result<()> {
        if !matches!(self.state, State::Prepared | State::Running) {
            return Err(Error::InvalidArg(format!(
                "iterate on {} in state {:?}",
                self.config.name, self.state
            )));
        }
        let sequence = inputs.values().next().map(|f| f.sequence).unwrap_or(0);

        let mut borrowed = Vec::new();
        let result = self.run_frame(inputs, outputs, parameters, statistics, sequence, &mut borrowed);
        let release = if result.is_ok() { sequence } else { -1 };
        self.release_references(&borrowed, release);
        if let Err(e) = &result {
            warn!("{} frame {} failed: {}", self.config.name, sequence, e);
        }
        result
    }

    fn run_frame(
        &mut self,
        inputs: &BTreeMap<u32, FrameBuffer>,
        outputs: &BTreeMap<u32, FrameBuffer>,
        parameters: &[u8],
        statistics: Option<&mut Vec<u8>>,
        sequence: i64,
        borrowed: &mut Vec<(ReferId, usize)>,
    ) -> Result<()> {
        self.bind_frames(inputs, outputs)?;
        self.rotate_references(sequence, borrowed)?;
        self.encode(parameters)?;
        if self.state == State::Prepared {
            self.start()?;
        }
        self.execute(sequence)?;
        if let Some(statistics) = statistics {
            self.decode(statistics)?;
        }
        Ok(())
    }

    fn bind_frames(
        &mut self,
        inputs: &BTreeMap<u32, FrameBuffer>,
        outputs: &BTreeMap<u32, FrameBuffer>,
    ) -> Result<()> {
        let frames = outputs
            .iter()
            .filter(|(uid, _)| !inputs.contains_key(*uid))
            .chain(inputs.iter());
        for (&uid, frame) in frames {
            let index = self.terminal_index(uid)?;
            let buffer = self.register_frame(frame)?;
            self.terminal_buffers[index] = Some(buffer);
        }
        Ok(())
    }

    /// Registers a caller frame, reusing the registration of a frame seen
    /// before with the same memory and size.
    fn register_frame(&mut self, frame: &FrameBuffer) -> Result<Arc<Buffer>> {
        if frame.size() == 0 {
            return Err(Error::InvalidArg("empty frame".to_owned()));
        }
        let key = match frame.memory() {
            FrameMemory::Dma(fd) if fd < 0 => {
                return Err(Error::InvalidArg(format!("frame with fd {}", fd)));
            }
            FrameMemory::Dma(fd) => FrameKey::Fd(fd),
            FrameMemory::Cpu(ptr) => FrameKey::Addr(ptr.as_ptr() as usize),
        };

        if let Some(pos) = self.registrations.iter().position(|r| r.key == key) {
            if self.registrations[pos].buffer.size() == frame.size() {
                return Ok(self.registrations[pos].buffer.clone());
            }
            debug!(
                "frame {:?} changed from {} to {} bytes",
                key,
                self.registrations[pos].buffer.size(),
                frame.size()
            );
            // unmap before the memory is mapped again
            let stale = self.registrations.remove(pos).buffer;
            for slot in self.terminal_buffers.iter_mut() {
                if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, &stale)) {
                    *slot = None;
                }
            }
            drop(stale);
        }

        let mut flags = if frame.flush {
            MemoryFlags::empty()
        } else {
            MemoryFlags::NO_FLUSH
        };
        let user = match frame.memory() {
            FrameMemory::Dma(fd) => {
                flags |= MemoryFlags::HARDWARE_ONLY;
                MemoryDesc::from_handle(fd, frame.size())
            }
            FrameMemory::Cpu(ptr) => MemoryDesc::from_cpu_ptr(ptr, frame.size()),
        };
        // SAFETY: the FrameBuffer constructors require the memory to outlive
        // its registration here.
        let buffer = unsafe { Buffer::with_user_memory(frame.size(), flags, &user)? };
        buffer.attach_device(&self.context)?;
        trace!("registered frame {:?} of {} bytes", key, frame.size());
        self.registrations.push(Registration {
            key,
            buffer: buffer.clone(),
        });
        Ok(buffer)
    }

    /// Moves every reference pair on by one frame.
    fn rotate_references(&mut self, sequence: i64, borrowed: &mut Vec<(ReferId, usize)>) -> Result<()> {
        if let Some(pair) = self.tnr {
            self.rotate(pair, sequence, borrowed)?;
        }
        for pair in self.dvs.clone() {
            self.terminal_buffers.swap(pair.input, pair.output);
        }
        for pair in self.tnr_sim.clone() {
            self.rotate(pair, sequence, borrowed)?;
        }
        Ok(())
    }

    fn rotate(
        &mut self,
        pair: TerminalPair,
        sequence: i64,
        borrowed: &mut Vec<(ReferId, usize)>,
    ) -> Result<()> {
        let Some(id) = self.shared.get(&pair.input).copied() else {
            self.terminal_buffers.swap(pair.input, pair.output);
            return Ok(());
        };
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::Internal("shared reference without a pool".to_owned()))?;
        let references = pool.acquire(id, sequence)?;
        self.terminal_buffers[pair.input] = Some(references.input);
        self.terminal_buffers[pair.output] = Some(references.output);
        borrowed.push((id, pair.output));
        Ok(())
    }

    fn release_references(&self, borrowed: &[(ReferId, usize)], sequence: i64) {
        let Some(pool) = &self.pool else {
            return;
        };
        for &(id, output) in borrowed {
            let Some(buffer) = self.terminal_buffer(output) else {
                continue;
            };
            if let Err(e) = pool.release(id, buffer, sequence) {
                warn!("cannot release reference {:#x}: {}", id, e);
            }
        }
    }

    /// Payload buffers in terminal order, each buffer once.
    fn payload_buffers(&self) -> Vec<(usize, Arc<Buffer>)> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };
        let mut payloads: Vec<(usize, Arc<Buffer>)> = Vec::new();
        for (index, requirement) in self.requirements.terminals.iter().enumerate() {
            if requirement.payload_size == 0 {
                continue;
            }
            if manifest.terminal(index).map_or(true, |t| t.terminal_type.is_data()) {
                continue;
            }
            let Some(buffer) = self.terminal_buffer(index) else {
                continue;
            };
            if payloads.iter().any(|(_, b)| Arc::ptr_eq(b, &buffer)) {
                warn!("terminal {} shares its payload with another terminal", index);
                continue;
            }
            payloads.push((index, buffer));
        }
        payloads
    }

    fn encode(&mut self, parameters: &[u8]) -> Result<()> {
        let buffers = self.payload_buffers();
        let mut views = buffers
            .iter()
            .map(|(index, buffer)| -> Result<_> { Ok((*index, buffer.map()?)) })
            .collect::<Result<Vec<_>>>()?;
        let mut payloads: Vec<TerminalPayload<'_>> = views
            .iter_mut()
            .map(|(terminal, view)| TerminalPayload {
                terminal: *terminal,
                data: view.as_mut_slice(),
            })
            .collect();
        self.codec.encode(parameters, &mut payloads)
    }

    fn decode(&mut self, statistics: &mut Vec<u8>) -> Result<()> {
        statistics.reserve(self.requirements.max_stats_size as usize);
        let buffers = self.payload_buffers();
        let mut views = buffers
            .iter()
            .map(|(index, buffer)| -> Result<_> { Ok((*index, buffer.map()?)) })
            .collect::<Result<Vec<_>>>()?;
        let mut payloads: Vec<TerminalPayload<'_>> = views
            .iter_mut()
            .map(|(terminal, view)| TerminalPayload {
                terminal: *terminal,
                data: view.as_mut_slice(),
            })
            .collect();
        self.codec.decode(&mut payloads, statistics)
    }

    fn command_config(
        &self,
        pg: &Arc<Buffer>,
        ext: &Arc<Buffer>,
        buffers: Vec<Option<Arc<Buffer>>>,
    ) -> CommandConfig {
        CommandConfig {
            id: self.config.pg_id,
            priority: self.config.priority,
            psys_frequency: self.config.psys_frequency,
            user_token: u64::from(self.config.pg_id),
            pg: Some(pg.clone()),
            pg_manifest_buf: self.manifest_buffer.clone(),
            ext_buf: Some(ext.clone()),
            pg_params_buf: None,
            buffers,
        }
    }

    /// Starts the persistent process group and keeps the token the firmware
    /// hands back.
    #[instrument(skip_all)]
    fn start(&mut self) -> Result<()> {
        let mut ppg = self
            .process_group
            .clone()
            .ok_or_else(|| Error::Internal("no process group".to_owned()))?;
        let count = ppg.terminal_count();
        ppg.fragment_state = 0;
        ppg.fragment_limit = 1;
        let ppg_buffer = self.device_buffer(ppg.size() as u32)?;
        ppg.write_to(ppg_buffer.map()?.as_mut_slice())?;

        let start_ext = self.ext_buffer()?;
        let mut start = Command::new(count);
        let config = self.command_config(&ppg_buffer, &start_ext, vec![None; count]);
        let timeout = self.config.event_timeout_ms;
        submit(&self.context, &mut self.event, &mut start, config, timeout)?;

        let token = read_token(ppg_buffer.map()?.as_slice())?;
        if token == 0 {
            return Err(Error::Protocol("started process group has no token".to_owned()));
        }
        info!("{} started, token {:#x}", self.config.name, token);

        self.submission = Some(Submission {
            frame: Command::new(count),
            frame_ext: self.ext_buffer()?,
            stop: Command::new(0),
            stop_ext: self.ext_buffer()?,
            ppg_buffer,
            token,
        });
        self.state = State::Running;
        Ok(())
    }

    /// Submits the frame once per fragment.
    #[instrument(skip_all, fields(fragments = self.fragment_count))]
    fn execute(&mut self, sequence: i64) -> Result<()> {
        let pg_buffer = self
            .pg_buffer
            .clone()
            .ok_or_else(|| Error::Internal("no process group buffer".to_owned()))?;
        let (frame_ext, token) = match &self.submission {
            Some(s) => (s.frame_ext.clone(), s.token),
            None => return Err(Error::Internal("process group not started".to_owned())),
        };

        let mut ext = CommandExt::ppg(self.kernel_bitmap);
        ext.frame_counter = sequence.max(0) as u64;
        ext.write_to(frame_ext.map()?.as_mut_slice())?;

        let count = self
            .process_group
            .as_ref()
            .map(ProcessGroup::terminal_count)
            .ok_or_else(|| Error::Internal("no process group".to_owned()))?;
        let mut buffers = vec![None; count];
        for (index, position) in self.terminal_positions.iter().enumerate() {
            if let Some(slot) = position.and_then(|p| buffers.get_mut(p)) {
                *slot = self.terminal_buffer(index);
            }
        }
        let config = self.command_config(&pg_buffer, &frame_ext, buffers);
        let timeout = self.config.event_timeout_ms;

        let (Some(pg), Some(submission)) = (self.process_group.as_mut(), self.submission.as_mut())
        else {
            return Err(Error::Internal("process group not started".to_owned()));
        };
        pg.token = token;
        for fragment in 0..pg.fragment_count {
            pg.fragment_state = fragment;
            pg.fragment_limit = fragment + 1;
            pg.write_to(pg_buffer.map()?.as_mut_slice())?;
            trace!(fragment, "submit");
            submit(
                &self.context,
                &mut self.event,
                &mut submission.frame,
                config.clone(),
                timeout,
            )?;
        }
        Ok(())
    }

    /// Stops the process group and releases everything [`prepare`] and
    /// [`iterate`] created. Calling it again does nothing.
    ///
    /// [`prepare`]: Self::prepare
    /// [`iterate`]: Self::iterate
    #[instrument(skip_all, fields(pg = self.config.pg_id))]
    pub fn deinit(&mut self) -> Result<()> {
        if self.state == State::Deinitialized {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(mut submission) = self.submission.take() {
            let config = self.command_config(&submission.ppg_buffer, &submission.stop_ext, Vec::new());
            let timeout = self.config.event_timeout_ms;
            if let Err(e) = submit(&self.context, &mut self.event, &mut submission.stop, config, timeout) {
                warn!("cannot stop {}: {}", self.config.name, e);
                result = Err(e);
            } else {
                info!("{} stopped", self.config.name);
            }
        }
        if self.codec_ready {
            self.codec.deinit();
            self.codec_ready = false;
        }

        self.terminal_buffers.iter_mut().for_each(|b| *b = None);
        self.reference_buffers.clear();
        self.registrations.clear();
        self.shared.clear();
        self.pg_buffer = None;
        self.manifest_buffer = None;
        self.process_group = None;
        self.terminal_positions.clear();
        self.state = State::Deinitialized;
        result
    }
}

impl Drop for ProcessGroupController {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            warn!("{} deinit failed: {}", self.config.name, e);
        }
    }
}

/// Host copy of the manifest blob that commands point the device at.
fn manifest_buffer(manifest: &ProgramGroupManifest) -> Result<Arc<Buffer>> {
    let bytes = manifest.as_bytes();
    let size = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidArg(format!("manifest of {} bytes", bytes.len())))?;
    let buffer = Buffer::new(size, MemoryFlags::ALLOCATE_CPU_PTR)?;
    buffer.map()?.as_mut_slice().copy_from_slice(bytes);
    Ok(buffer)
}

fn dimension(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::InvalidArg(format!("dimension {} exceeds 16 bits", value)))
}

/// Queues `command` and waits for its completion.
#[instrument(skip_all, fields(issue = command.issue_id()))]
fn submit(
    context: &Context,
    event: &mut Event,
    command: &mut Command,
    config: CommandConfig,
    timeout_ms: u64,
) -> Result<()> {
    command.set_config(config)?;
    command.enqueue(context)?;
    event.set_config(EventConfig {
        issue_id: command.issue_id(),
        timeout_ms,
        ..Default::default()
    });
    if let Err(e) = event.wait(context) {
        // the firmware must not run it after the frame is abandoned
        if let Err(cancel) = command.cancel(context) {
            warn!("cannot cancel issue {}: {}", command.issue_id(), cancel);
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{simple_manifest, tnr_manifest, FakeCodec, MockDriver, SIMPLE_PG};

    const SIMPLE_PAYLOADS: [u32; 6] = [64, 0, 128, 0, 256, 0];
    const TNR_PAYLOADS: [u32; 8] = [32, 0, 64, 0, 0, 48, 0, 48];

    fn controller(mock: &MockDriver, pg_id: u32, payloads: &[u32]) -> (ProcessGroupController, FakeCodec) {
        controller_with(mock, ControllerConfig {
            pg_id,
            name: format!("pg{}", pg_id),
            ..Default::default()
        }, payloads)
    }

    fn controller_with(
        mock: &MockDriver,
        config: ControllerConfig,
        payloads: &[u32],
    ) -> (ProcessGroupController, FakeCodec) {
        let context = Arc::new(Context::with_driver(Box::new(mock.clone())));
        let codec = FakeCodec::new(payloads.to_vec());
        let ctrl = ProcessGroupController::with_context(config, context, Box::new(codec.clone()));
        (ctrl, codec)
    }

    fn infos(entries: &[(u32, u32, u32)]) -> BTreeMap<u32, FrameInfo> {
        entries
            .iter()
            .map(|&(uid, w, h)| (uid, FrameInfo::new(w, h, FourCC::NV12)))
            .collect()
    }

    fn dma(uid: u32, fd: RawFd, size: u32, sequence: i64) -> BTreeMap<u32, FrameBuffer> {
        BTreeMap::from([(uid, unsafe { FrameBuffer::from_fd(fd, size) }.with_sequence(sequence))])
    }

    fn prepared_simple(mock: &MockDriver) -> Result<(ProcessGroupController, FakeCodec)> {
        let (mut ctrl, codec) = controller(mock, SIMPLE_PG, &SIMPLE_PAYLOADS);
        ctrl.init()?;
        ctrl.set_input_info(&infos(&[(1, 2000, 64)]))?;
        ctrl.set_output_info(&infos(&[(5, 1920, 64)]))?;
        ctrl.prepare(&[])?;
        Ok((ctrl, codec))
    }

    fn tnr_mock() -> MockDriver {
        MockDriver::with_manifests(vec![simple_manifest(), tnr_manifest()])
    }

    #[test]
    fn init_finds_the_manifest() -> Result<()> {
        let mock = tnr_mock();
        let (mut ctrl, _) = controller(&mock, PG_ID_TNR, &TNR_PAYLOADS);
        ctrl.init()?;
        assert_eq!(ctrl.state(), State::CapabilityKnown);
        assert_eq!(ctrl.platform(), Some(Platform::Ipu6));
        assert_eq!(ctrl.manifest().map(|m| m.terminal_count()), Some(8));
        assert!(matches!(ctrl.init(), Err(Error::InvalidArg(_))));
        Ok(())
    }

    #[test]
    fn init_errors() {
        let mock = tnr_mock();
        let (mut ctrl, _) = controller(&mock, 42, &[]);
        assert!(matches!(ctrl.init(), Err(Error::NoEntry(_))));

        let mock = MockDriver::new();
        mock.set_dev_model("ipu4");
        let (mut ctrl, _) = controller(&mock, SIMPLE_PG, &[]);
        assert!(matches!(ctrl.init(), Err(Error::Unsupported(_))));

        let config = ControllerConfig {
            pg_id: SIMPLE_PG,
            device: PathBuf::from("/nonexistent/ipu-psys0"),
            ..Default::default()
        };
        let mut ctrl = ProcessGroupController::new(config, Box::new(FakeCodec::new(Vec::new())));
        assert!(matches!(ctrl.init(), Err(Error::Device(_))));
    }

    #[test]
    fn terminal_uids_are_checked() -> Result<()> {
        let mock = MockDriver::new();
        let config = ControllerConfig {
            pg_id: SIMPLE_PG,
            terminal_base_uid: 100,
            ..Default::default()
        };
        let (mut ctrl, _) = controller_with(&mock, config, &SIMPLE_PAYLOADS);
        assert!(matches!(ctrl.set_input_info(&infos(&[(101, 64, 64)])), Err(Error::InvalidArg(_))));
        ctrl.init()?;
        ctrl.set_input_info(&infos(&[(101, 64, 64)]))?;
        assert_eq!(ctrl.input_main_terminal(), Some(1));
        assert!(ctrl.set_input_info(&infos(&[(99, 64, 64)])).is_err());
        assert!(ctrl.set_output_info(&infos(&[(106, 64, 64)])).is_err());
        assert!(ctrl.set_disabled_terminals(&[105]).is_ok());
        Ok(())
    }

    #[test]
    fn prepare_builds_the_process_group() -> Result<()> {
        let mock = MockDriver::new();
        let (ctrl, codec) = prepared_simple(&mock)?;
        assert_eq!(ctrl.state(), State::Prepared);
        assert_eq!(ctrl.fragment_count(), 3);
        assert_eq!(ctrl.kernel_bitmap(), [0, 1, 2, 4, 5].into_iter().collect());

        let pg = ctrl.process_group().unwrap();
        let kept: Vec<u16> = pg.terminals.iter().map(|t| t.manifest_index).collect();
        assert_eq!(kept, [0, 1, 2, 4, 5]);
        assert_eq!(ctrl.terminal_position(3), None);
        assert_eq!(ctrl.terminal_position(4), Some(3));
        assert_eq!(ctrl.terminal_position(5), Some(4));
        assert_eq!(pg.num_queues, 1);
        assert_eq!(pg.protocol_version, PROTOCOL_PPG);
        let input = &pg.terminals[1];
        assert_eq!(input.fragments.len(), 3);
        assert_eq!(input.frame.map(|f| (f.width, f.height)), Some((2000, 64)));
        assert_eq!(pg.terminals[2].payload_size, 128);

        assert!(ctrl.terminal_buffer(0).is_some());
        assert!(ctrl.terminal_buffer(2).is_some());
        assert!(ctrl.terminal_buffer(3).is_none());
        assert!(ctrl.terminal_buffer(1).is_none());

        let log = codec.log();
        assert_eq!(log.calls, ["init", "prepare", "fragment_descriptors"]);
        assert_eq!(log.frame_formats[1], Some(FrameFormatType::Nv12));
        let config = log.config.as_ref().unwrap();
        assert_eq!(config.fragment_count, 3);
        assert_eq!(config.input_main_frame.map(|f| f.width), Some(2000));
        assert_eq!(config.output_main_frame.map(|f| f.width), Some(1920));
        Ok(())
    }

    #[test]
    fn prepare_rejects_a_short_codec() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, _) = controller(&mock, SIMPLE_PG, &[64, 0]);
        ctrl.init()?;
        assert!(matches!(ctrl.prepare(&[]), Err(Error::Protocol(_))));
        Ok(())
    }

    #[test]
    fn iterate_starts_then_runs_every_fragment() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, codec) = prepared_simple(&mock)?;
        let size = FrameInfo::new(2000, 64, FourCC::NV12).size();

        let mut stats = Vec::new();
        ctrl.iterate(&dma(1, 50, size, 0), &dma(5, 51, size, 0), &[], Some(&mut stats))?;
        assert_eq!(ctrl.state(), State::Running);

        let queued = mock.queued();
        assert_eq!(queued.len(), 4);
        let start = &queued[0];
        assert_eq!((start.fragment_state, start.fragment_limit), (0, 1));
        assert!(start.buffers.iter().all(|b| { b.len } == 0));
        let token = start.token;
        assert_eq!(ctrl.token(), Some(token));

        // commands carry the manifest blob
        let manifest_size = simple_manifest().size() as u32;
        for cmd in &queued {
            assert_ne!({ cmd.command.pg_manifest }, 0);
            assert_eq!({ cmd.command.pg_manifest_size }, manifest_size);
            assert_eq!({ cmd.command.frame_counter }, 0);
        }
        assert_eq!({ start.command.kernel_enable_bitmap }, ctrl.kernel_bitmap().to_words());

        for (i, cmd) in queued[1..].iter().enumerate() {
            assert_eq!(cmd.fragment_state, i as u16);
            assert_eq!(cmd.fragment_limit, i as u16 + 1);
            assert_eq!(cmd.token, token);
            assert_eq!(cmd.buffers.len(), 5);
            assert_eq!(cmd.buffers[1].fd(), 50);
            assert_eq!(cmd.buffers[4].fd(), 51);
            assert_eq!({ cmd.command.kernel_enable_bitmap }, ctrl.kernel_bitmap().to_words());
        }

        assert_eq!(stats, [0, 2, 4]);
        let log = codec.log();
        assert_eq!(log.encoded, [vec![0, 2, 4]]);
        assert_eq!(log.calls.last(), Some(&"decode"));
        Ok(())
    }

    #[test]
    fn later_frames_reuse_the_started_group() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, codec) = prepared_simple(&mock)?;
        let size = FrameInfo::new(2000, 64, FourCC::NV12).size();

        ctrl.iterate(&dma(1, 50, size, 0), &dma(5, 51, size, 0), &[], None)?;
        let mapped = mock.mapped_count();
        ctrl.iterate(&dma(1, 50, size, 1), &dma(5, 51, size, 1), &[], None)?;
        assert_eq!(mock.mapped_count(), mapped);
        assert_eq!(ctrl.registered_frame_count(), 2);

        let queued = mock.queued();
        assert_eq!(queued.len(), 7);
        assert_eq!({ queued[6].command.frame_counter }, 1);
        assert_eq!(codec.log().seen[1], [(0, 1), (2, 1), (4, 1)]);

        ctrl.iterate(&dma(1, 50, size / 2, 2), &dma(5, 51, size, 2), &[], None)?;
        assert_eq!(ctrl.registered_frame_count(), 2);
        assert_eq!(mock.mapped_count(), mapped);
        assert_eq!({ mock.queued()[9].buffers[1].bytes_used }, size / 2);
        Ok(())
    }

    #[test]
    fn iterate_needs_a_prepared_group() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, _) = controller(&mock, SIMPLE_PG, &SIMPLE_PAYLOADS);
        ctrl.init()?;
        let empty = BTreeMap::new();
        assert!(matches!(ctrl.iterate(&empty, &empty, &[], None), Err(Error::InvalidArg(_))));
        Ok(())
    }

    #[test]
    fn completion_timeout_fails_the_frame() -> Result<()> {
        let mock = MockDriver::new();
        let config = ControllerConfig {
            pg_id: SIMPLE_PG,
            event_timeout_ms: 20,
            ..Default::default()
        };
        let (mut ctrl, _) = controller_with(&mock, config, &SIMPLE_PAYLOADS);
        ctrl.init()?;
        ctrl.prepare(&[])?;
        mock.hold_completions(true);
        let empty = BTreeMap::new();
        assert!(matches!(ctrl.iterate(&empty, &empty, &[], None), Err(Error::Timeout(20))));
        assert_eq!(ctrl.state(), State::Prepared);
        let start = mock.queued()[0].command.issue_id;
        assert_eq!(mock.cancelled(), [start]);

        mock.hold_completions(false);
        mock.set_event_error(5);
        ctrl.iterate(&empty, &empty, &[], None)?;
        assert_eq!(ctrl.state(), State::Running);
        assert_eq!(mock.cancelled().len(), 1);
        Ok(())
    }

    #[test]
    fn deinit_stops_the_group_once() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, codec) = prepared_simple(&mock)?;
        let empty = BTreeMap::new();
        ctrl.iterate(&empty, &empty, &[], None)?;
        let before = mock.queued().len();

        ctrl.deinit()?;
        let queued = mock.queued();
        assert_eq!(queued.len(), before + 1);
        assert_eq!({ queued[before].command.bufcount }, 0);
        assert_eq!(ctrl.state(), State::Deinitialized);
        assert!(ctrl.terminal_buffer(0).is_none());

        ctrl.deinit()?;
        drop(ctrl);
        assert_eq!(mock.queued().len(), before + 1);
        assert_eq!(codec.log().calls.iter().filter(|c| **c == "deinit").count(), 1);
        assert_eq!(mock.mapped_count(), 0);
        Ok(())
    }

    #[test]
    fn deinit_before_start_submits_nothing() -> Result<()> {
        let mock = MockDriver::new();
        let (mut ctrl, _) = prepared_simple(&mock)?;
        ctrl.deinit()?;
        assert!(mock.queued().is_empty());
        Ok(())
    }

    #[test]
    fn local_references_ping_pong() -> Result<()> {
        let mock = tnr_mock();
        let (mut ctrl, codec) = controller(&mock, PG_ID_TNR, &TNR_PAYLOADS);
        ctrl.init()?;
        ctrl.set_input_info(&infos(&[(1, 640, 100)]))?;
        ctrl.set_output_info(&infos(&[(3, 640, 100)]))?;
        ctrl.prepare(&[])?;

        let reference = FrameInfo::new(640, 128, FourCC::NV12);
        assert_eq!(codec.log().frame_formats[4], Some(FrameFormatType::Nv12));
        let input = ctrl.terminal_buffer(4).unwrap();
        let output = ctrl.terminal_buffer(6).unwrap();
        assert_eq!(input.size(), reference.size());
        assert!(!Arc::ptr_eq(&input, &output));
        let sim_in = ctrl.terminal_buffer(5).unwrap();
        let sim_out = ctrl.terminal_buffer(7).unwrap();

        let size = FrameInfo::new(640, 100, FourCC::NV12).size();
        ctrl.iterate(&dma(1, 60, size, 0), &dma(3, 61, size, 0), &[], None)?;
        assert!(Arc::ptr_eq(&ctrl.terminal_buffer(4).unwrap(), &output));
        assert!(Arc::ptr_eq(&ctrl.terminal_buffer(6).unwrap(), &input));
        assert!(Arc::ptr_eq(&ctrl.terminal_buffer(5).unwrap(), &sim_out));

        ctrl.iterate(&dma(1, 60, size, 1), &dma(3, 61, size, 1), &[], None)?;
        assert!(Arc::ptr_eq(&ctrl.terminal_buffer(4).unwrap(), &input));
        assert!(Arc::ptr_eq(&ctrl.terminal_buffer(5).unwrap(), &sim_in));

        let log = codec.log();
        assert_eq!(log.encoded[0], [0, 2, 5, 7]);
        // the similarity output of frame 0 is the input of frame 1
        assert!(log.seen[1].contains(&(5, 1)));
        Ok(())
    }

    #[test]
    fn shared_references_cross_streams() -> Result<()> {
        let pool = Arc::new(SharedReferencePool::new(3));
        let producer_id = refer_id(0, PG_ID_TNR, 5);
        let consumer_id = refer_id(1, PG_ID_TNR, 5);
        pool.set_refer_pair("main", producer_id, "still", consumer_id)?;

        let make = |stream_id: u32| -> Result<(ProcessGroupController, FakeCodec, MockDriver)> {
            let mock = tnr_mock();
            let config = ControllerConfig {
                pg_id: PG_ID_TNR,
                stream_id,
                ..Default::default()
            };
            let (mut ctrl, codec) = controller_with(&mock, config, &TNR_PAYLOADS);
            ctrl.set_shared_reference_pool(pool.clone());
            ctrl.init()?;
            ctrl.prepare(&[])?;
            Ok((ctrl, codec, mock))
        };
        let (mut producer, _, _) = make(0)?;
        let (mut consumer, consumer_codec, _) = make(1)?;
        assert_eq!(pool.min_buffer_count(producer_id), 3);

        let empty = BTreeMap::new();
        let at = |sequence: i64| {
            BTreeMap::from([(1, unsafe { FrameBuffer::from_fd(70, 64) }.with_sequence(sequence))])
        };
        producer.iterate(&at(0), &empty, &[], None)?;
        producer.iterate(&at(1), &empty, &[], None)?;

        consumer.iterate(&at(2), &empty, &[], None)?;
        // the producer wrote 2 into its payloads at frame 1
        assert!(consumer_codec.log().seen[0].contains(&(5, 2)));
        Ok(())
    }

    #[test]
    fn missing_shared_reference_fails_cleanly() -> Result<()> {
        let pool = Arc::new(SharedReferencePool::new(3));
        pool.set_refer_pair("main", refer_id(0, PG_ID_TNR, 5), "still", refer_id(1, PG_ID_TNR, 5))?;

        let mock = tnr_mock();
        let config = ControllerConfig {
            pg_id: PG_ID_TNR,
            stream_id: 1,
            ..Default::default()
        };
        let (mut consumer, _) = controller_with(&mock, config, &TNR_PAYLOADS);
        consumer.set_shared_reference_pool(pool.clone());
        consumer.init()?;
        consumer.prepare(&[])?;

        let empty = BTreeMap::new();
        let frame = BTreeMap::from([(1, unsafe { FrameBuffer::from_fd(70, 64) }.with_sequence(5))]);
        assert!(matches!(
            consumer.iterate(&frame, &empty, &[], None),
            Err(Error::Timeout(_))
        ));
        assert!(mock.queued().is_empty());

        let frame = BTreeMap::from([(1, unsafe { FrameBuffer::from_fd(70, 64) }.with_sequence(0))]);
        consumer.iterate(&frame, &empty, &[], None)?;
        Ok(())
    }

    #[test]
    fn pair_tables() {
        assert_eq!(terminal_pairs(PG_ID_TNR, PairKind::Tnr), [pair(4, 6)]);
        assert_eq!(terminal_pairs(PG_ID_DVS, PairKind::Dvs).len(), 3);
        assert!(terminal_pairs(PG_ID_DVS, PairKind::Tnr).is_empty());
        assert!(terminal_pairs(SIMPLE_PG, PairKind::TnrSim).is_empty());
    }
}
