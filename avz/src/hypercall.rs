//! Hypercalls.
//!
//! A hypercall is a trap from a domain into the hypervisor, the domain's
//! counterpart of a system call. The trap carries a hypercall number and a
//! reference to an argument block. [`Avz::hypercall`] decodes the number,
//! checks that the caller may issue the call, runs it, and writes the
//! outcome into the block: a non-negative result, or a negative errno for a
//! recoverable failure (see [`AvzError::errno`]).
//!
//! A number that names no hypercall, or a block of the wrong kind, halts the
//! hypervisor.
//!
//! ## Privilege
//! Calls that act on other domains are reserved to the agency. An ME may
//! read its own descriptor and move its own ME state. Everything else acts
//! on the caller's own tables.
use crate::{
    domain::Domain,
    error::{status, Result},
    evtchn::{Channel, Port},
    gnttab::GrantRef,
    shared::{MeDescriptor, MeState},
    Avz, AvzError, DomId,
};
use alloc::{string::String, vec::Vec};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Hypercall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(usize)]
pub enum HypercallNr {
    ConsoleIo = 0,
    Domctl = 1,
    EventChannelOp = 2,
    GrantTableOp = 3,
    DomainDescriptor = 4,
    SnapshotRead = 5,
    SnapshotWrite = 6,
    InjectMe = 7,
    SetDcEvent = 8,
    GetDcEvent = 9,
    KillMe = 10,
    GetMeState = 11,
    SetMeState = 12,
    Migration = 13,
    SchedOp = 14,
}

/// Domain control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DomctlCmd {
    /// Pause an ME.
    PauseMe = 0,
    /// Unpause an ME.
    UnpauseMe = 1,
    /// Physical address of an ME's control page.
    GetSharedPageAddress = 2,
}

/// Migration commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MigrationCmd {
    /// [`Avz::migration_init`].
    Init = 0,
    /// [`Avz::migration_final`].
    Final = 1,
}

/// Event channel operations on the caller's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvtchnOp {
    AllocUnbound { remote: DomId },
    BindInterdomain { remote: DomId, remote_port: Port },
    BindVirq { virq: u32 },
    Close { port: Port },
    Send { port: Port },
    Clear { port: Port },
    Mask { port: Port },
    Unmask { port: Port },
    /// The channel is written back into `channel`.
    Status { port: Port, channel: Option<Channel> },
}

/// Grant table operations of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnttabOp {
    Grant { target: DomId, pfn: usize },
    Revoke { gref: GrantRef },
    Map { gref: GrantRef, origin: DomId },
    Unmap { ipa_pfn: usize },
}

/// Scheduling requests of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedOp {
    Yield,
    Block,
    /// Arm the one-shot timer, or cancel it with None.
    SetTimer { deadline: Option<u64> },
}

/// Arguments of one hypercall.
///
/// Fields a call writes back to are documented on the variant.
#[derive(Debug)]
pub enum Call<'a> {
    Console { buf: &'a [u8] },
    Domctl { cmd: u32, slot: usize },
    Evtchn(EvtchnOp),
    Gnttab(GnttabOp),
    /// The descriptor is written back into `desc`.
    Descriptor { slot: usize, desc: Option<MeDescriptor> },
    /// The snapshot is written back into `buf`.
    SnapshotRead { slot: usize, buf: Vec<u8> },
    SnapshotWrite { snapshot: &'a [u8] },
    InjectMe { image: &'a [u8], entry: usize, size: usize },
    SetDcEvent { domid: DomId, event: u64 },
    /// The event is written back into `event`.
    GetDcEvent { event: Option<u64> },
    KillMe { slot: usize },
    /// The state is written back into `state`.
    GetMeState { slot: usize, state: Option<MeState> },
    SetMeState { slot: usize, state: MeState },
    Migration { cmd: u32, slot: usize, pfn_offset: Option<isize> },
    Sched(SchedOp),
}

impl Call<'_> {
    /// Number of the hypercall that takes these arguments.
    pub fn nr(&self) -> HypercallNr {
        match self {
            Call::Console { .. } => HypercallNr::ConsoleIo,
            Call::Domctl { .. } => HypercallNr::Domctl,
            Call::Evtchn(_) => HypercallNr::EventChannelOp,
            Call::Gnttab(_) => HypercallNr::GrantTableOp,
            Call::Descriptor { .. } => HypercallNr::DomainDescriptor,
            Call::SnapshotRead { .. } => HypercallNr::SnapshotRead,
            Call::SnapshotWrite { .. } => HypercallNr::SnapshotWrite,
            Call::InjectMe { .. } => HypercallNr::InjectMe,
            Call::SetDcEvent { .. } => HypercallNr::SetDcEvent,
            Call::GetDcEvent { .. } => HypercallNr::GetDcEvent,
            Call::KillMe { .. } => HypercallNr::KillMe,
            Call::GetMeState { .. } => HypercallNr::GetMeState,
            Call::SetMeState { .. } => HypercallNr::SetMeState,
            Call::Migration { .. } => HypercallNr::Migration,
            Call::Sched(_) => HypercallNr::SchedOp,
        }
    }
}

/// Argument block passed by reference with a hypercall.
#[derive(Debug)]
pub struct ArgBlock<'a> {
    pub call: Call<'a>,
    /// Result of the call, or a negative errno.
    pub ret: i64,
}

impl<'a> ArgBlock<'a> {
    pub fn new(call: Call<'a>) -> Self {
        Self { call, ret: 0 }
    }
}

fn agency_only(caller: &Domain) -> Result<()> {
    if caller.domain_id.is_agency() {
        Ok(())
    } else {
        Err(AvzError::InvalidDomain(caller.domain_id))
    }
}

fn agency_or_self(caller: &Domain, slot: usize) -> Result<()> {
    if caller.domain_id.is_agency() || caller.domain_id == DomId(slot) {
        Ok(())
    } else {
        Err(AvzError::InvalidDomain(caller.domain_id))
    }
}

#[inline]
fn slot_id(r: Result<DomId>) -> Result<i64> {
    r.map(|id| id.0 as i64)
}

impl Avz {
    /// Hypercall `nr` of the domain running on `cpu`.
    ///
    /// Interrupts of `cpu` stay masked while the call runs. Deferred work
    /// raised by the call, a reschedule in particular, runs before
    /// returning; interrupts are unmasked again unless `cpu` is left idle.
    pub fn hypercall(&self, cpu: usize, nr: usize, args: &mut ArgBlock<'_>) {
        let nr = HypercallNr::try_from(nr)
            .unwrap_or_else(|e| bug!("cpu{}: unknown hypercall {}", cpu, e.number));
        if args.call.nr() != nr {
            bug!("cpu{}: {:?} with arguments of {:?}", cpu, nr, args.call.nr());
        }
        let caller = self.current(cpu);
        self.irq.disable(cpu);
        log::trace!("{}: {:?}", caller.domain_id, nr);
        args.ret = self.dispatch(&caller, &mut args.call);
        drop(caller);

        self.do_softirq(cpu);
        if !self.pcpu(cpu).current().is_idle() {
            self.irq.enable(cpu);
        }
    }

    fn dispatch(&self, caller: &Domain, call: &mut Call<'_>) -> i64 {
        match call {
            Call::Console { buf } => {
                abyss::print!("{}", String::from_utf8_lossy(*buf));
                buf.len() as i64
            }
            Call::Domctl { cmd, slot } => status(agency_only(caller).and_then(|_| {
                let _domctl = self.domctl_lock.lock();
                self.domctl(*cmd, *slot)
            })),
            Call::Evtchn(op) => status(self.evtchn_op(caller, op)),
            Call::Gnttab(op) => status(self.gnttab_op(caller, op)),
            Call::Descriptor { slot, desc } => status(
                agency_or_self(caller, *slot)
                    .and_then(|_| self.me_descriptor(*slot))
                    .map(|d| {
                        *desc = Some(d);
                        0
                    }),
            ),
            Call::SnapshotRead { slot, buf } => status(
                agency_only(caller)
                    .and_then(|_| self.snapshot_read(*slot))
                    .map(|snapshot| {
                        *buf = snapshot;
                        buf.len() as i64
                    }),
            ),
            Call::SnapshotWrite { snapshot } => {
                status(agency_only(caller).and_then(|_| slot_id(self.snapshot_write(*snapshot))))
            }
            Call::InjectMe { image, entry, size } => {
                match agency_only(caller).and_then(|_| self.inject_me(*image, *entry, *size)) {
                    Ok(id) => id.0 as i64,
                    Err(e) => {
                        log::warn!("{}: inject failed: {}", caller.domain_id, e);
                        -1
                    }
                }
            }
            Call::SetDcEvent { domid, event } => status(self.set_dc_event(*domid, *event).map(|_| 0)),
            Call::GetDcEvent { event } => {
                *event = self.get_dc_event(caller);
                0
            }
            Call::KillMe { slot } => {
                status(agency_only(caller).and_then(|_| self.kill_me(*slot)).map(|_| 0))
            }
            Call::GetMeState { slot, state } => status(
                agency_or_self(caller, *slot)
                    .and_then(|_| self.me(*slot))
                    .map(|d| {
                        let s = self.get_me_state(&d);
                        *state = Some(s);
                        u64::from(s) as i64
                    }),
            ),
            Call::SetMeState { slot, state } => status(
                agency_or_self(caller, *slot)
                    .and_then(|_| self.me(*slot))
                    .map(|d| {
                        self.set_me_state(&d, *state);
                        0
                    }),
            ),
            Call::Migration {
                cmd,
                slot,
                pfn_offset,
            } => status(agency_only(caller).and_then(|_| {
                let r = match MigrationCmd::try_from(*cmd) {
                    Ok(MigrationCmd::Init) => self.migration_init(*slot),
                    Ok(MigrationCmd::Final) => self.migration_final(*slot, *pfn_offset),
                    Err(e) => bug!("unknown migration command {}", e.number),
                };
                r.map(|_| 0)
            })),
            Call::Sched(op) => {
                match op {
                    SchedOp::Yield => self.yield_cpu(caller),
                    SchedOp::Block => self.block(caller),
                    SchedOp::SetTimer { deadline } => self.set_timer(caller, *deadline),
                }
                0
            }
        }
    }

    fn domctl(&self, cmd: u32, slot: usize) -> Result<i64> {
        let d = self.me(slot)?;
        match DomctlCmd::try_from(cmd) {
            Ok(DomctlCmd::PauseMe) => self.pause(&d),
            Ok(DomctlCmd::UnpauseMe) => self.unpause(&d),
            Ok(DomctlCmd::GetSharedPageAddress) => return Ok(d.control.pa().into_usize() as i64),
            Err(e) => bug!("unknown domctl {}", e.number),
        }
        Ok(0)
    }

    fn evtchn_op(&self, caller: &Domain, op: &mut EvtchnOp) -> Result<i64> {
        let port = match *op {
            EvtchnOp::AllocUnbound { remote } => self.evtchn_alloc_unbound(caller, remote)?,
            EvtchnOp::BindInterdomain {
                remote,
                remote_port,
            } => self.evtchn_bind_interdomain(caller, remote, remote_port)?,
            EvtchnOp::BindVirq { virq } => self.evtchn_bind_virq(caller, virq)?,
            EvtchnOp::Close { port } => self.evtchn_close(caller, port).map(|_| 0)?,
            EvtchnOp::Send { port } => self.evtchn_send(caller, port).map(|_| 0)?,
            EvtchnOp::Clear { port } => self.evtchn_clear(caller, port).map(|_| 0)?,
            EvtchnOp::Mask { port } => self.evtchn_mask(caller, port).map(|_| 0)?,
            EvtchnOp::Unmask { port } => self.evtchn_unmask(caller, port).map(|_| 0)?,
            EvtchnOp::Status { port, .. } => {
                let ch = self.evtchn_status(caller, port)?;
                if let EvtchnOp::Status { channel, .. } = op {
                    *channel = Some(ch);
                }
                0
            }
        };
        Ok(port.into())
    }

    fn gnttab_op(&self, caller: &Domain, op: &GnttabOp) -> Result<i64> {
        Ok(match *op {
            GnttabOp::Grant { target, pfn } => self.gnttab_grant(caller, target, pfn)?.into(),
            GnttabOp::Revoke { gref } => self.gnttab_revoke(caller, gref).map(|_| 0)?,
            GnttabOp::Map { gref, origin } => self.gnttab_map(caller, gref, origin)? as i64,
            GnttabOp::Unmap { ipa_pfn } => self.gnttab_unmap(caller, ipa_pfn).map(|_| 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder, ME_CHUNK_SIZE, MEMSLOT_BASE};
    use abyss::interrupt::InterruptState;

    fn avz() -> Avz {
        let avz = AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize();
        avz.schedule(0);
        avz
    }

    fn call<'a>(avz: &Avz, cpu: usize, c: Call<'a>) -> ArgBlock<'a> {
        let mut args = ArgBlock::new(c);
        let nr = args.call.nr().into();
        avz.hypercall(cpu, nr, &mut args);
        args
    }

    #[test]
    fn inject_and_kill() {
        let avz = avz();
        let image = [0u8; 16];
        let args = call(
            &avz,
            0,
            Call::InjectMe {
                image: &image,
                entry: 0,
                size: ME_CHUNK_SIZE,
            },
        );
        assert_eq!(args.ret, MEMSLOT_BASE as i64);

        let args = call(
            &avz,
            0,
            Call::GetMeState {
                slot: MEMSLOT_BASE,
                state: None,
            },
        );
        assert!(matches!(
            args.call,
            Call::GetMeState {
                state: Some(MeState::Booting),
                ..
            }
        ));

        let big = alloc::vec![0u8; ME_CHUNK_SIZE];
        let args = call(
            &avz,
            0,
            Call::InjectMe {
                image: &big,
                entry: 0,
                size: ME_CHUNK_SIZE,
            },
        );
        assert_eq!(args.ret, -1);

        assert_eq!(call(&avz, 0, Call::KillMe { slot: MEMSLOT_BASE }).ret, 0);
        assert_eq!(
            call(&avz, 0, Call::KillMe { slot: MEMSLOT_BASE }).ret,
            AvzError::InvalidDomain(DomId(MEMSLOT_BASE)).errno()
        );
    }

    #[test]
    fn domctl_pauses_an_me() {
        let avz = avz();
        let id = avz.inject_me(b"me", 0, ME_CHUNK_SIZE).unwrap();
        let d = avz.domain(id).unwrap();
        let unpause = Call::Domctl {
            cmd: DomctlCmd::UnpauseMe.into(),
            slot: id.0,
        };
        assert_eq!(call(&avz, 0, unpause).ret, 0);
        assert_eq!(d.pause_count(), 0);

        let args = call(
            &avz,
            0,
            Call::Domctl {
                cmd: DomctlCmd::GetSharedPageAddress.into(),
                slot: id.0,
            },
        );
        assert_eq!(args.ret, d.control.pa().into_usize() as i64);
    }

    #[test]
    #[should_panic]
    fn unknown_domctl_halts() {
        let avz = avz();
        let id = avz.inject_me(b"me", 0, ME_CHUNK_SIZE).unwrap();
        call(&avz, 0, Call::Domctl { cmd: 9, slot: id.0 });
    }

    #[test]
    #[should_panic]
    fn unknown_number_halts() {
        let avz = avz();
        let mut args = ArgBlock::new(Call::Sched(SchedOp::Yield));
        avz.hypercall(0, 99, &mut args);
    }

    #[test]
    #[should_panic]
    fn mismatched_block_halts() {
        let avz = avz();
        let mut args = ArgBlock::new(Call::Sched(SchedOp::Yield));
        avz.hypercall(0, HypercallNr::KillMe.into(), &mut args);
    }

    #[test]
    fn events_between_agency_and_itself() {
        let avz = avz();
        let agency = avz.agency();
        let a = call(
            &avz,
            0,
            Call::Evtchn(EvtchnOp::AllocUnbound {
                remote: DomId::AGENCY,
            }),
        )
        .ret as Port;
        let b = call(
            &avz,
            0,
            Call::Evtchn(EvtchnOp::BindInterdomain {
                remote: DomId::AGENCY,
                remote_port: a,
            }),
        )
        .ret as Port;
        assert_eq!(call(&avz, 0, Call::Evtchn(EvtchnOp::Send { port: b })).ret, 0);
        assert!(agency.control.is_pending(a));

        let args = call(
            &avz,
            0,
            Call::Evtchn(EvtchnOp::Status {
                port: 77,
                channel: None,
            }),
        );
        assert_eq!(args.ret, AvzError::InvalidPort(77).errno());
        assert_eq!(
            call(&avz, 0, Call::Evtchn(EvtchnOp::Close { port: a })).ret,
            0
        );
    }

    #[test]
    fn an_me_cannot_inject() {
        let avz = AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize();
        let id = avz.inject_me(b"me", 0, ME_CHUNK_SIZE).unwrap();
        let d = avz.domain(id).unwrap();
        avz.unpause(&d);
        avz.schedule(avz.config().me_cpu);
        let cpu = avz.config().me_cpu;
        assert_eq!(avz.current(cpu).domain_id, id);

        let args = call(
            &avz,
            cpu,
            Call::InjectMe {
                image: b"x",
                entry: 0,
                size: ME_CHUNK_SIZE,
            },
        );
        assert_eq!(args.ret, -1);
        let args = call(&avz, cpu, Call::KillMe { slot: id.0 });
        assert_eq!(args.ret, AvzError::InvalidDomain(id).errno());

        // An ME walks its own state machine.
        let args = call(
            &avz,
            cpu,
            Call::SetMeState {
                slot: id.0,
                state: MeState::Preparing,
            },
        );
        assert_eq!(args.ret, 0);
        assert_eq!(avz.get_me_state(&d), MeState::Preparing);
        assert_eq!(avz.irq().current(cpu), InterruptState::On);
    }

    #[test]
    fn dc_event_through_hypercalls() {
        let avz = avz();
        let set = |event| {
            call(
                &avz,
                0,
                Call::SetDcEvent {
                    domid: DomId::AGENCY,
                    event,
                },
            )
            .ret
        };
        assert_eq!(set(5), 0);
        assert_eq!(set(6), AvzError::Busy.errno());
        let args = call(&avz, 0, Call::GetDcEvent { event: None });
        assert!(matches!(args.call, Call::GetDcEvent { event: Some(5) }));
    }

    #[test]
    fn console_output_reaches_the_console() {
        use alloc::{boxed::Box, sync::Arc};
        use spin_lock::SpinLock;

        struct Capture(Arc<SpinLock<String>>);
        impl abyss::kprint::Console for Capture {
            fn write_str(&mut self, s: &str) {
                self.0.lock().push_str(s);
            }
        }

        let out = Arc::new(SpinLock::new(String::new()));
        abyss::kprint::set_console(Box::new(Capture(out.clone())));
        let avz = avz();
        let args = call(&avz, 0, Call::Console { buf: b"hello from d0\n" });
        assert_eq!(args.ret, 14);
        assert!(out.lock().contains("hello from d0\n"));
    }
}
