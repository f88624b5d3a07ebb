//! Reference implementation of the `strand_*` runtime primitives.
//!
//! Channels are bounded FIFO queues of simulated values. A fixed-width
//! channel hands out 64-bit words on receive, encoded from the value that
//! was sent; a generic channel hands out the values themselves and knows
//! its element's zero value from the type descriptor it was created with.
//!
//! A buffered channel holds up to `cap` values; an unbuffered one holds a
//! single value, standing in for the rendezvous a second thread would
//! provide.
//!
//! Select checks its cases in registration order and commits the first one
//! that can proceed, falls back to the default case when there is one, and
//! otherwise runs a queued thread and tries again.

use std::collections::VecDeque;

use strand_codegen::lir::{DescriptorKind, Type};
use tracing::trace;

use crate::interp::{Machine, Trap};
use crate::memory::{Ptr, Val};
use crate::SimError;

/// Counters of runtime events, for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub fifo_channels: usize,
    pub generic_channels: usize,
    pub selects: usize,
    pub threads_created: usize,
    pub threads_exited: usize,
    pub defers_run: usize,
    pub retaddrs_set: usize,
    pub recovers: usize,
    pub deferred_recovers: usize,
    pub heap_allocs: usize,
}

#[derive(Debug)]
enum ChanKind {
    Fifo { width: u8 },
    /// Holds the element's type descriptor.
    Generic { elem: Ptr },
}

#[derive(Debug)]
struct Channel {
    kind: ChanKind,
    cap: usize,
    queue: VecDeque<Val>,
    closed: bool,
}

impl Channel {
    fn can_send(&self) -> bool {
        self.closed || self.queue.len() < self.cap.max(1)
    }

    fn can_recv(&self) -> bool {
        self.closed || !self.queue.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Case {
    Default,
    Send { chan: u32, value: Ptr },
    Recv { chan: u32, out: Ptr, ok: Ptr },
}

#[derive(Debug, Default)]
struct SelectState {
    cases: Vec<(i32, Case)>,
}

/// A spawned thread waiting for its turn: the entry adapter and its argument.
#[derive(Debug)]
struct PendingThread {
    entry: Val,
    arg: Val,
}

/// Runtime state owned by a [`Machine`].
#[derive(Debug, Default)]
pub(crate) struct Runtime {
    channels: Vec<Channel>,
    selects: Vec<SelectState>,
    /// Deferred `(thunk, arg)` pairs, one list per active call.
    defers: Vec<Vec<(Val, Val)>>,
    pending: VecDeque<PendingThread>,
    pub(crate) stats: RuntimeStats,
}

impl Runtime {
    pub(crate) fn enter_frame(&mut self) {
        self.defers.push(Vec::new());
    }

    pub(crate) fn leave_frame(&mut self) {
        self.defers.pop();
    }
}

// ── Argument decoding ────────────────────────────────────────────────

fn arg<'a>(name: &str, args: &'a [Val], i: usize) -> Result<&'a Val, SimError> {
    args.get(i)
        .ok_or_else(|| SimError::Type(format!("{name}: missing argument {i}")))
}

fn ptr_arg(name: &str, args: &[Val], i: usize) -> Result<Ptr, SimError> {
    arg(name, args, i)?
        .as_ptr()
        .cloned()
        .ok_or_else(|| SimError::Type(format!("{name}: argument {i} is not a pointer")))
}

fn int_arg(name: &str, args: &[Val], i: usize) -> Result<i64, SimError> {
    arg(name, args, i)?
        .as_i64()
        .ok_or_else(|| SimError::Type(format!("{name}: argument {i} is not an integer")))
}

fn chan_arg(name: &str, args: &[Val], i: usize) -> Result<u32, SimError> {
    match ptr_arg(name, args, i)? {
        Ptr::Chan(id) => Ok(id),
        Ptr::Null => Err(SimError::Deadlock(format!("{name} on a nil channel"))),
        other => Err(SimError::Type(format!("{name}: {other:?} is not a channel"))),
    }
}

fn select_arg(name: &str, args: &[Val], i: usize) -> Result<u32, SimError> {
    match ptr_arg(name, args, i)? {
        Ptr::Select(id) => Ok(id),
        other => Err(SimError::Type(format!("{name}: {other:?} is not a select"))),
    }
}

fn int_result(ret: &Type, value: i64) -> Val {
    Val::int(ret.int_bits().unwrap_or(64), value)
}

impl Machine {
    /// Execute the runtime primitive `name`.
    pub(crate) fn call_runtime(&mut self, name: &str, args: &[Val], ret: &Type) -> Result<Option<Val>, Trap> {
        trace!(primitive = name, args = args.len(), "runtime call");
        match name {
            // ── Channels ──
            "strand_chan_new_fifo" => {
                let width = int_arg(name, args, 0)? as u8;
                let cap = self.capacity(name, args, 1)?;
                self.runtime.stats.fifo_channels += 1;
                Ok(Some(self.new_channel(ChanKind::Fifo { width }, cap)))
            }
            "strand_chan_new" => {
                let tydesc = ptr_arg(name, args, 0)?;
                let elem = self.descriptor_elem(&tydesc)?;
                let cap = self.capacity(name, args, 1)?;
                self.runtime.stats.generic_channels += 1;
                Ok(Some(self.new_channel(ChanKind::Generic { elem }, cap)))
            }
            "strand_chan_send_fifo" => {
                let chan = chan_arg(name, args, 0)?;
                let value = self.memory.load_any(&ptr_arg(name, args, 1)?)?;
                self.chan_send(chan, value)?;
                Ok(None)
            }
            "strand_chan_send" => {
                let chan = chan_arg(name, args, 1)?;
                let value = self.memory.load_any(&ptr_arg(name, args, 2)?)?;
                self.chan_send(chan, value)?;
                Ok(None)
            }
            "strand_chan_recv_fifo" => {
                let chan = chan_arg(name, args, 0)?;
                let value = self.chan_recv(chan)?;
                let word = match value {
                    Some(v) => self.encode_word(&v)?,
                    None => 0,
                };
                Ok(Some(Val::Int { bits: 64, value: word }))
            }
            "strand_chan_recv" | "strand_chan_recv2" => {
                let chan = chan_arg(name, args, 1)?;
                let out = ptr_arg(name, args, 2)?;
                let received = self.chan_recv(chan)?;
                let ok = received.is_some();
                let value = match received {
                    Some(v) => v,
                    None => self.zero_elem(chan)?,
                };
                self.memory.store(&out, value)?;
                Ok((name == "strand_chan_recv2").then(|| Val::bool(ok)))
            }
            "strand_chan_close" => {
                let chan = chan_arg(name, args, 0)?;
                let ch = self.channel_mut(chan)?;
                if ch.closed {
                    return Err(SimError::Panic("close of closed channel".into()).into());
                }
                ch.closed = true;
                Ok(None)
            }

            // ── Select ──
            "strand_select_new" => {
                let id = self.runtime.selects.len() as u32;
                self.runtime.selects.push(SelectState::default());
                self.runtime.stats.selects += 1;
                Ok(Some(Val::Ptr(Ptr::Select(id))))
            }
            "strand_select_default" => {
                let sel = select_arg(name, args, 0)?;
                let index = int_arg(name, args, 1)? as i32;
                self.add_case(sel, index, Case::Default)?;
                Ok(None)
            }
            "strand_select_send" => {
                let sel = select_arg(name, args, 0)?;
                let case = Case::Send {
                    chan: chan_arg(name, args, 1)?,
                    value: ptr_arg(name, args, 2)?,
                };
                self.add_case(sel, int_arg(name, args, 3)? as i32, case)?;
                Ok(None)
            }
            "strand_select_recv2" => {
                let sel = select_arg(name, args, 0)?;
                let case = Case::Recv {
                    chan: chan_arg(name, args, 1)?,
                    out: ptr_arg(name, args, 2)?,
                    ok: ptr_arg(name, args, 3)?,
                };
                self.add_case(sel, int_arg(name, args, 4)? as i32, case)?;
                Ok(None)
            }
            "strand_select_go" => {
                let sel = select_arg(name, args, 0)?;
                let index = self.select_go(sel)?;
                Ok(Some(int_result(ret, i64::from(index))))
            }

            // ── Defer and recover ──
            "strand_defer" => {
                let thunk = arg(name, args, 0)?.clone();
                let thunk_arg = arg(name, args, 1)?.clone();
                self.runtime
                    .defers
                    .last_mut()
                    .ok_or_else(|| SimError::Unsupported("defer outside a function".into()))?
                    .push((thunk, thunk_arg));
                Ok(None)
            }
            "strand_undefer" => {
                let pending = match self.runtime.defers.last_mut() {
                    Some(list) => std::mem::take(list),
                    None => Vec::new(),
                };
                for (thunk, thunk_arg) in pending.into_iter().rev() {
                    self.runtime.stats.defers_run += 1;
                    self.call_value(&thunk, vec![thunk_arg])?;
                }
                Ok(None)
            }
            "strand_defer_set_retaddr" => {
                match ptr_arg(name, args, 0)? {
                    Ptr::Block { .. } => self.runtime.stats.retaddrs_set += 1,
                    other => {
                        return Err(SimError::Type(format!("resume address {other:?} is not a block")).into())
                    }
                }
                Ok(None)
            }
            // Nothing ever unwinds here, so there is never a panic to recover.
            "strand_recover" => {
                self.runtime.stats.recovers += 1;
                Ok(Some(Val::null()))
            }
            "strand_deferred_recover" => {
                self.runtime.stats.deferred_recovers += 1;
                Ok(Some(Val::null()))
            }
            "strand_panic" => {
                let value = self.memory.load_any(&ptr_arg(name, args, 1)?)?;
                Err(SimError::Panic(value.to_string()).into())
            }

            // ── Heap and threads ──
            "strand_gc_alloc" => {
                if int_arg(name, args, 0)? < 0 {
                    return Err(SimError::BadMemory("negative allocation size".into()).into());
                }
                self.runtime.stats.heap_allocs += 1;
                Ok(Some(Val::Ptr(self.memory.allocate())))
            }
            "strand_thread_create" => {
                let entry = arg(name, args, 0)?.clone();
                let thread_arg = arg(name, args, 1)?.clone();
                self.runtime.stats.threads_created += 1;
                self.runtime.pending.push_back(PendingThread {
                    entry,
                    arg: thread_arg,
                });
                Ok(None)
            }
            "strand_thread_exit" => {
                self.runtime.stats.threads_exited += 1;
                Err(Trap::ThreadExit)
            }
            _ => Err(SimError::UnknownFunction(name.to_string()).into()),
        }
    }

    // ── Threads ──────────────────────────────────────────────────────

    /// Run the oldest queued thread to completion. Returns false when no
    /// thread was waiting.
    pub(crate) fn run_one_pending(&mut self) -> Result<bool, Trap> {
        let Some(thread) = self.runtime.pending.pop_front() else {
            return Ok(false);
        };
        trace!(entry = %thread.entry, "run thread");
        match self.call_value(&thread.entry, vec![thread.arg]) {
            Ok(_) | Err(Trap::ThreadExit) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Retry `attempt` until it succeeds, running queued threads in between.
    fn block_on<T>(
        &mut self,
        what: &str,
        mut attempt: impl FnMut(&mut Machine) -> Result<Option<T>, Trap>,
    ) -> Result<T, Trap> {
        loop {
            if let Some(done) = attempt(self)? {
                return Ok(done);
            }
            if !self.run_one_pending()? {
                return Err(SimError::Deadlock(what.to_string()).into());
            }
        }
    }

    // ── Channels ─────────────────────────────────────────────────────

    fn capacity(&self, name: &str, args: &[Val], i: usize) -> Result<usize, SimError> {
        let cap = int_arg(name, args, i)?;
        usize::try_from(cap).map_err(|_| SimError::Panic(format!("makechan: size out of range ({cap})")))
    }

    fn new_channel(&mut self, kind: ChanKind, cap: usize) -> Val {
        let id = self.runtime.channels.len() as u32;
        self.runtime.channels.push(Channel {
            kind,
            cap,
            queue: VecDeque::new(),
            closed: false,
        });
        Val::Ptr(Ptr::Chan(id))
    }

    fn channel(&self, id: u32) -> Result<&Channel, SimError> {
        self.runtime
            .channels
            .get(id as usize)
            .ok_or_else(|| SimError::BadMemory(format!("unknown channel {id}")))
    }

    fn channel_mut(&mut self, id: u32) -> Result<&mut Channel, SimError> {
        self.runtime
            .channels
            .get_mut(id as usize)
            .ok_or_else(|| SimError::BadMemory(format!("unknown channel {id}")))
    }

    fn chan_send(&mut self, chan: u32, value: Val) -> Result<(), Trap> {
        self.block_on("send on a full channel", |m| Ok(m.channel(chan)?.can_send().then_some(())))?;
        self.chan_send_ready(chan, value)
    }

    fn chan_send_ready(&mut self, chan: u32, value: Val) -> Result<(), Trap> {
        let ch = self.channel_mut(chan)?;
        if ch.closed {
            return Err(SimError::Panic("send on closed channel".into()).into());
        }
        ch.queue.push_back(value);
        Ok(())
    }

    /// Receive from `chan`; `None` once it is closed and drained.
    fn chan_recv(&mut self, chan: u32) -> Result<Option<Val>, Trap> {
        self.block_on("receive from an empty channel", |m| Ok(m.channel(chan)?.can_recv().then_some(())))?;
        Ok(self.channel_mut(chan)?.queue.pop_front())
    }

    /// The 64-bit word a fixed-width channel delivers for `value`.
    fn encode_word(&mut self, value: &Val) -> Result<u64, SimError> {
        Ok(match value {
            Val::Int { value, .. } => *value,
            Val::F64(f) => f.to_bits(),
            Val::F32(f) => u64::from(f.to_bits()),
            Val::Ptr(p) => self.memory.ptr_to_word(p),
            other => return Err(SimError::Type(format!("{other} does not fit a channel word"))),
        })
    }

    fn descriptor_elem(&self, tydesc: &Ptr) -> Result<Ptr, SimError> {
        match self.memory.load_any(tydesc)? {
            Val::Struct(fields) => match fields.get(3) {
                Some(Val::Ptr(elem)) => Ok(elem.clone()),
                _ => Err(SimError::BadMemory("channel descriptor has no element".into())),
            },
            other => Err(SimError::BadMemory(format!("{other} is not a type descriptor"))),
        }
    }

    /// The zero value delivered by a closed channel.
    fn zero_elem(&self, chan: u32) -> Result<Val, SimError> {
        let elem = match &self.channel(chan)?.kind {
            ChanKind::Fifo { width } => {
                return Ok(Val::Int {
                    bits: u32::from(*width),
                    value: 0,
                })
            }
            ChanKind::Generic { elem } => elem.clone(),
        };
        let fields = match self.memory.load_any(&elem)? {
            Val::Struct(fields) => fields,
            _ => return Ok(Val::Undef),
        };
        let kind = fields.first().and_then(Val::as_u64).unwrap_or(0);
        let size = fields.get(1).and_then(Val::as_u64).unwrap_or(0);
        Ok(match kind {
            k if k == DescriptorKind::Bool.code() as u64 => Val::bool(false),
            k if k == DescriptorKind::Float.code() as u64 && size == 4 => Val::F32(0.0),
            k if k == DescriptorKind::Float.code() as u64 => Val::F64(0.0),
            k if k == DescriptorKind::Int.code() as u64
                || k == DescriptorKind::Uint.code() as u64
                || k == DescriptorKind::Uintptr.code() as u64 =>
            {
                Val::int((size * 8) as u32, 0)
            }
            k if k == DescriptorKind::Pointer.code() as u64
                || k == DescriptorKind::UnsafePointer.code() as u64
                || k == DescriptorKind::Chan.code() as u64
                || k == DescriptorKind::Func.code() as u64 =>
            {
                Val::null()
            }
            _ => Val::Undef,
        })
    }

    // ── Select ───────────────────────────────────────────────────────

    fn add_case(&mut self, sel: u32, index: i32, case: Case) -> Result<(), SimError> {
        self.runtime
            .selects
            .get_mut(sel as usize)
            .ok_or_else(|| SimError::BadMemory(format!("unknown select {sel}")))?
            .cases
            .push((index, case));
        Ok(())
    }

    fn select_go(&mut self, sel: u32) -> Result<i32, Trap> {
        let cases = self
            .runtime
            .selects
            .get(sel as usize)
            .ok_or_else(|| SimError::BadMemory(format!("unknown select {sel}")))?
            .cases
            .clone();
        let default = cases
            .iter()
            .find(|(_, c)| matches!(c, Case::Default))
            .map(|(i, _)| *i);

        let (index, case) = self.block_on("select with no ready case", |m| {
            for (index, case) in &cases {
                let ready = match case {
                    Case::Default => false,
                    Case::Send { chan, .. } => m.channel(*chan)?.can_send(),
                    Case::Recv { chan, .. } => m.channel(*chan)?.can_recv(),
                };
                if ready {
                    return Ok(Some((*index, case.clone())));
                }
            }
            Ok(default.map(|i| (i, Case::Default)))
        })?;

        match case {
            Case::Default => {}
            Case::Send { chan, value } => {
                let value = self.memory.load_any(&value)?;
                self.chan_send_ready(chan, value)?;
            }
            Case::Recv { chan, out, ok } => {
                let received = self.channel_mut(chan)?.queue.pop_front();
                let flag = received.is_some();
                if out != Ptr::Null {
                    let value = match received {
                        Some(v) => v,
                        None => self.zero_elem(chan)?,
                    };
                    self.memory.store(&out, value)?;
                }
                self.memory.store(&ok, Val::bool(flag))?;
            }
        }
        trace!(select = sel, index, "select committed");
        Ok(index)
    }
}
