//! Event channels.
//!
//! An event channel is a doorbell between two domains, or between the
//! hypervisor and a domain for a virtual interrupt line. Each domain owns a
//! table of [`NR_EVTCHN`] channels indexed by port; port 0 is reserved.
//!
//! ```text
//!            alloc_unbound             bind_interdomain (by the peer)
//!   Free ------------------> Unbound -------------------------------> Interdomain
//!     ^                                                                   |
//!     +------------------------------ close ------------------------------+
//!                                  (peer goes back to Unbound)
//! ```
//!
//! Sending on a channel sets the port's bit in the peer's control page and
//! wakes the peer if it is blocked. Tables are locked for one operation at a
//! time; operations on two tables take the locks in domain id order, and no
//! lock is held while a domain is woken.
use crate::{domain::Domain, error::Result, Avz, AvzError, DomId};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

pub type Port = u32;

/// Channels per domain.
pub const NR_EVTCHN: usize = 128;
/// Virtual interrupt lines per domain.
pub const NR_VIRQ: u32 = 8;
/// One-shot domain timer.
pub const VIRQ_TIMER: u32 = 0;
/// A domain-call event was posted.
pub const VIRQ_DC_EVENT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Free,
    Reserved,
    /// Waiting for `remote` to bind.
    Unbound { remote: DomId },
    Interdomain { remote: DomId, remote_port: Port },
    Virq { virq: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub state: ChannelState,
    /// Cleared while the domain masks the channel.
    pub may_notify: bool,
}

impl Channel {
    const FREE: Channel = Channel {
        state: ChannelState::Free,
        may_notify: true,
    };
}

/// Event channels of one domain.
pub struct EvtchnTable {
    channels: Vec<Channel>,
    virqs: [Option<Port>; NR_VIRQ as usize],
}

impl EvtchnTable {
    pub fn new() -> Self {
        let mut channels = alloc::vec![Channel::FREE; NR_EVTCHN];
        channels[0].state = ChannelState::Reserved;
        Self {
            channels,
            virqs: [None; NR_VIRQ as usize],
        }
    }

    pub fn get(&self, port: Port) -> Result<Channel> {
        self.channels
            .get(port as usize)
            .copied()
            .ok_or(AvzError::InvalidPort(port))
    }

    fn set_state(&mut self, port: Port, state: ChannelState) {
        self.channels[port as usize] = Channel {
            state,
            may_notify: true,
        };
    }

    fn alloc_port(&mut self) -> Result<Port> {
        self.channels
            .iter()
            .position(|c| c.state == ChannelState::Free)
            .map(|p| p as Port)
            .ok_or(AvzError::NoFreePort)
    }

    /// Port bound to `virq`.
    pub fn virq_port(&self, virq: u32) -> Option<Port> {
        self.virqs.get(virq as usize).copied().flatten()
    }

    /// Every port in use, with its state.
    pub fn bindings(&self) -> Vec<(Port, ChannelState)> {
        self.channels
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, c)| c.state != ChannelState::Free)
            .map(|(p, c)| (p as Port, c.state))
            .collect()
    }

    /// Rebuild the table from `bindings` taken on another host.
    ///
    /// Interdomain channels come back unbound: their peers stayed behind.
    pub(crate) fn restore(bindings: &[(Port, ChannelState)]) -> Result<Self> {
        let mut table = Self::new();
        for &(port, state) in bindings {
            if port == 0 || port as usize >= NR_EVTCHN {
                return Err(AvzError::Snapshot);
            }
            let state = match state {
                ChannelState::Interdomain { remote, .. } => ChannelState::Unbound { remote },
                ChannelState::Virq { virq } if virq < NR_VIRQ => {
                    table.virqs[virq as usize] = Some(port);
                    state
                }
                ChannelState::Virq { .. } | ChannelState::Free => return Err(AvzError::Snapshot),
                state => state,
            };
            table.set_state(port, state);
        }
        Ok(table)
    }

    /// Free `port` if it is still in state `expected`.
    ///
    /// `peer` is the table of the remote end of an interdomain channel, None
    /// for a loopback channel or a remote that is gone. Returns false if the
    /// state changed under the caller.
    fn close(
        &mut self,
        me: DomId,
        port: Port,
        expected: ChannelState,
        peer: Option<&mut EvtchnTable>,
    ) -> Result<bool> {
        let state = self.get(port)?.state;
        if state != expected {
            return Ok(false);
        }
        match state {
            ChannelState::Free | ChannelState::Reserved => return Err(AvzError::InvalidPort(port)),
            ChannelState::Virq { virq } => self.virqs[virq as usize] = None,
            ChannelState::Interdomain {
                remote,
                remote_port,
            } => {
                let unbound = ChannelState::Unbound { remote: me };
                if remote == me {
                    self.set_state(remote_port, unbound);
                } else if let Some(peer) = peer {
                    peer.set_state(remote_port, unbound);
                }
            }
            ChannelState::Unbound { .. } => (),
        }
        self.set_state(port, ChannelState::Free);
        Ok(true)
    }
}

impl Default for EvtchnTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` on the tables of `a` and `b`, locked in domain id order. The
/// second table is None when `a` and `b` are the same domain.
fn with_tables<R>(
    a: &Domain,
    b: &Domain,
    f: impl FnOnce(&mut EvtchnTable, Option<&mut EvtchnTable>) -> R,
) -> R {
    if a.domain_id == b.domain_id {
        f(&mut *a.evtchn.lock(), None)
    } else if a.domain_id < b.domain_id {
        let mut ta = a.evtchn.lock();
        let mut tb = b.evtchn.lock();
        f(&mut *ta, Some(&mut *tb))
    } else {
        let mut tb = b.evtchn.lock();
        let mut ta = a.evtchn.lock();
        f(&mut *ta, Some(&mut *tb))
    }
}

impl Avz {
    /// Open a channel of `d` that `remote` may bind to.
    pub fn evtchn_alloc_unbound(&self, d: &Domain, remote: DomId) -> Result<Port> {
        if self.domain(remote).is_none() {
            return Err(AvzError::InvalidDomain(remote));
        }
        let mut table = d.evtchn.lock();
        let port = table.alloc_port()?;
        table.set_state(port, ChannelState::Unbound { remote });
        log::debug!("{}: port {} unbound for {}", d.domain_id, port, remote);
        Ok(port)
    }

    /// Connect a new channel of `d` to the unbound `remote_port` of `remote`.
    pub fn evtchn_bind_interdomain(
        &self,
        d: &Domain,
        remote: DomId,
        remote_port: Port,
    ) -> Result<Port> {
        let r = self
            .domain(remote)
            .ok_or(AvzError::InvalidDomain(remote))?;
        let port = with_tables(d, &r, |lt, rt| {
            let peer = rt.as_deref().unwrap_or(&*lt).get(remote_port)?;
            if peer.state != (ChannelState::Unbound { remote: d.domain_id }) {
                return Err(AvzError::InvalidPort(remote_port));
            }
            let port = lt.alloc_port()?;
            lt.set_state(
                port,
                ChannelState::Interdomain {
                    remote,
                    remote_port,
                },
            );
            rt.unwrap_or(lt).set_state(
                remote_port,
                ChannelState::Interdomain {
                    remote: d.domain_id,
                    remote_port: port,
                },
            );
            Ok(port)
        })?;
        log::debug!(
            "{}: port {} bound to {}:{}",
            d.domain_id,
            port,
            remote,
            remote_port
        );
        Ok(port)
    }

    /// Bind a new channel of `d` to the virtual interrupt `virq`.
    pub fn evtchn_bind_virq(&self, d: &Domain, virq: u32) -> Result<Port> {
        if virq >= NR_VIRQ {
            return Err(AvzError::Invalid);
        }
        let mut table = d.evtchn.lock();
        if table.virq_port(virq).is_some() {
            return Err(AvzError::AlreadyBound(virq));
        }
        let port = table.alloc_port()?;
        table.set_state(port, ChannelState::Virq { virq });
        table.virqs[virq as usize] = Some(port);
        Ok(port)
    }

    /// Close `port` of `d`. The remote end of an interdomain channel goes
    /// back to unbound.
    pub fn evtchn_close(&self, d: &Domain, port: Port) -> Result<()> {
        loop {
            let state = d.evtchn.lock().get(port)?.state;
            let peer = match state {
                ChannelState::Free | ChannelState::Reserved => {
                    return Err(AvzError::InvalidPort(port))
                }
                ChannelState::Interdomain { remote, .. } if remote != d.domain_id => {
                    self.domain(remote)
                }
                _ => None,
            };
            let closed = match peer {
                Some(r) => with_tables(d, &r, |lt, rt| lt.close(d.domain_id, port, state, rt)),
                None => d.evtchn.lock().close(d.domain_id, port, state, None),
            }?;
            if closed {
                break;
            }
        }
        d.control.clear_pending(port);
        log::debug!("{}: port {} closed", d.domain_id, port);
        Ok(())
    }

    /// Close every channel of `d`.
    pub fn evtchn_close_all(&self, d: &Domain) {
        let ports: Vec<_> = d.evtchn.lock().bindings().into_iter().map(|(p, _)| p).collect();
        for port in ports {
            let _ = self.evtchn_close(d, port);
        }
    }

    /// Signal the remote end of `port` of `d`.
    ///
    /// A signal on a channel nobody bound yet is dropped.
    pub fn evtchn_send(&self, d: &Domain, port: Port) -> Result<()> {
        let chan = d.evtchn.lock().get(port)?;
        match chan.state {
            ChannelState::Interdomain {
                remote,
                remote_port,
            } => {
                if let Some(r) = self.domain(remote) {
                    self.mark_pending(&r, remote_port);
                }
                Ok(())
            }
            ChannelState::Unbound { .. } => Ok(()),
            ChannelState::Virq { .. } => Err(AvzError::Invalid),
            ChannelState::Free | ChannelState::Reserved => Err(AvzError::InvalidPort(port)),
        }
    }

    /// Raise `virq` of `d`. Dropped if `d` has not bound it.
    pub fn notify_via_virq(&self, d: &Domain, virq: u32) {
        let port = d.evtchn.lock().virq_port(virq);
        if let Some(port) = port {
            self.mark_pending(d, port);
        }
    }

    /// Set `port` pending in `d` and, unless it is masked, raise the upcall
    /// and wake `d`.
    pub(crate) fn mark_pending(&self, d: &Domain, port: Port) {
        if d.control.set_pending(port) {
            return;
        }
        let may_notify = d
            .evtchn
            .lock()
            .get(port)
            .map_or(false, |c| c.may_notify);
        if may_notify {
            d.control.set_upcall_pending(true);
            self.wake(d);
        }
    }

    /// Clear the pending bit of `port`.
    pub fn evtchn_clear(&self, d: &Domain, port: Port) -> Result<()> {
        d.evtchn.lock().get(port)?;
        d.control.clear_pending(port);
        Ok(())
    }

    /// Stop `port` from raising upcalls. Signals still set the pending bit.
    pub fn evtchn_mask(&self, d: &Domain, port: Port) -> Result<()> {
        let mut table = d.evtchn.lock();
        table.get(port)?;
        table.channels[port as usize].may_notify = false;
        Ok(())
    }

    /// Let `port` raise upcalls again, delivering one if it is pending.
    pub fn evtchn_unmask(&self, d: &Domain, port: Port) -> Result<()> {
        {
            let mut table = d.evtchn.lock();
            table.get(port)?;
            table.channels[port as usize].may_notify = true;
        }
        if d.control.is_pending(port) {
            d.control.set_upcall_pending(true);
            self.wake(d);
        }
        Ok(())
    }

    pub fn evtchn_status(&self, d: &Domain, port: Port) -> Result<Channel> {
        d.evtchn.lock().get(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder, ME_CHUNK_SIZE};
    use alloc::sync::Arc;

    fn setup() -> (Avz, Arc<Domain>, Arc<Domain>) {
        let avz = AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize();
        let me = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        let agency = avz.agency();
        (avz, agency, me)
    }

    #[test]
    fn bind_send_close() {
        let (avz, agency, me) = setup();
        let unbound = avz.evtchn_alloc_unbound(&agency, me.domain_id).unwrap();
        assert_eq!(unbound, 1);
        let port = avz
            .evtchn_bind_interdomain(&me, DomId::AGENCY, unbound)
            .unwrap();
        assert_eq!(
            avz.evtchn_status(&agency, unbound).unwrap().state,
            ChannelState::Interdomain {
                remote: me.domain_id,
                remote_port: port
            }
        );

        avz.evtchn_send(&me, port).unwrap();
        assert!(agency.control.is_pending(unbound));
        assert!(agency.control.upcall_pending());

        avz.evtchn_close(&me, port).unwrap();
        assert_eq!(
            avz.evtchn_status(&agency, unbound).unwrap().state,
            ChannelState::Unbound {
                remote: me.domain_id
            }
        );
        assert_eq!(
            avz.evtchn_status(&me, port).unwrap().state,
            ChannelState::Free
        );
        // The agency's end is unbound again: signals are dropped.
        avz.evtchn_send(&agency, unbound).unwrap();
        assert!(!me.control.any_pending());
    }

    #[test]
    fn binding_needs_a_matching_unbound_port() {
        let (avz, agency, me) = setup();
        let unbound = avz.evtchn_alloc_unbound(&agency, DomId::AGENCY).unwrap();
        assert_eq!(
            avz.evtchn_bind_interdomain(&me, DomId::AGENCY, unbound),
            Err(AvzError::InvalidPort(unbound))
        );
        assert_eq!(
            avz.evtchn_bind_interdomain(&me, DomId::AGENCY, 0),
            Err(AvzError::InvalidPort(0))
        );
        assert_eq!(
            avz.evtchn_close(&me, 0),
            Err(AvzError::InvalidPort(0))
        );
        assert_eq!(
            avz.evtchn_send(&me, NR_EVTCHN as Port),
            Err(AvzError::InvalidPort(NR_EVTCHN as Port))
        );
    }

    #[test]
    fn loopback_channel() {
        let (avz, _, me) = setup();
        let a = avz.evtchn_alloc_unbound(&me, me.domain_id).unwrap();
        let b = avz.evtchn_bind_interdomain(&me, me.domain_id, a).unwrap();
        avz.evtchn_send(&me, b).unwrap();
        assert!(me.control.is_pending(a));
        avz.evtchn_close(&me, a).unwrap();
        assert_eq!(
            avz.evtchn_status(&me, b).unwrap().state,
            ChannelState::Unbound {
                remote: me.domain_id
            }
        );
    }

    #[test]
    fn virq_binds_once() {
        let (avz, _, me) = setup();
        let port = avz.evtchn_bind_virq(&me, VIRQ_TIMER).unwrap();
        assert_eq!(
            avz.evtchn_bind_virq(&me, VIRQ_TIMER),
            Err(AvzError::AlreadyBound(VIRQ_TIMER))
        );
        assert_eq!(avz.evtchn_bind_virq(&me, NR_VIRQ), Err(AvzError::Invalid));
        avz.notify_via_virq(&me, VIRQ_DC_EVENT);
        assert!(!me.control.any_pending());
        avz.notify_via_virq(&me, VIRQ_TIMER);
        assert!(me.control.is_pending(port));
        assert_eq!(avz.evtchn_send(&me, port), Err(AvzError::Invalid));
    }

    #[test]
    fn masked_port_stays_quiet() {
        let (avz, _, me) = setup();
        let port = avz.evtchn_bind_virq(&me, VIRQ_TIMER).unwrap();
        avz.evtchn_mask(&me, port).unwrap();
        avz.notify_via_virq(&me, VIRQ_TIMER);
        assert!(me.control.is_pending(port));
        assert!(!me.control.upcall_pending());
        avz.evtchn_unmask(&me, port).unwrap();
        assert!(me.control.upcall_pending());
        avz.evtchn_clear(&me, port).unwrap();
        assert!(!me.control.is_pending(port));
    }

    #[test]
    fn signal_wakes_a_blocked_domain() {
        let (avz, agency, me) = setup();
        let unbound = avz.evtchn_alloc_unbound(&me, DomId::AGENCY).unwrap();
        let port = avz
            .evtchn_bind_interdomain(&agency, me.domain_id, unbound)
            .unwrap();
        avz.unpause(&me);
        avz.block(&me);
        assert!(me.is_blocked());
        avz.evtchn_send(&agency, port).unwrap();
        assert!(!me.is_blocked());
        assert!(me.is_runnable());
    }

    #[test]
    fn ports_run_out() {
        let (avz, _, me) = setup();
        for _ in 1..NR_EVTCHN {
            avz.evtchn_alloc_unbound(&me, DomId::AGENCY).unwrap();
        }
        assert_eq!(
            avz.evtchn_alloc_unbound(&me, DomId::AGENCY),
            Err(AvzError::NoFreePort)
        );
        avz.evtchn_close_all(&me);
        assert!(me.evtchn.lock().bindings().is_empty());
    }
}
