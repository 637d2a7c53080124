//! Collaborator entry points
//!
//! Memory management, IPC, signals, tracing and process management never
//! touch runtime flags themselves. They report what happened through these
//! calls and the dispatcher keeps the ready queues in step.

use alloc::vec::Vec;
use core::iter;

use gsched_abi::{Endpoint, SlotId};
use log::trace;

use crate::scheduler::core::dispatcher::Dispatcher;
use crate::scheduler::core::error::{SchedError, SchedResult};
use crate::scheduler::process::{BlockReason, MiscFlags, PrivId, RuntimeFlags, Transition};

impl Dispatcher {
    // ═══════════════════════════════════════════════════════════════
    // Memory
    // ═══════════════════════════════════════════════════════════════

    pub fn page_fault(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.block(pid, BlockReason::PageFault)
    }

    pub fn page_fault_resolved(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::PageFault)
    }

    /// Hold a process until its page tables exist
    pub fn vm_inhibit(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.block(pid, BlockReason::VmInhibited)
    }

    pub fn page_tables_ready(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::VmInhibited)
    }

    /// `origin` asked the memory manager to act on `target`
    pub fn vm_request(&mut self, origin: Endpoint, target: Endpoint) -> SchedResult<()> {
        self.table.resolve(target)?;
        self.block(origin, BlockReason::VmRequestOrigin)?;
        self.block(target, BlockReason::VmRequestTarget)?;
        Ok(())
    }

    pub fn vm_request_done(&mut self, origin: Endpoint, target: Endpoint) -> SchedResult<()> {
        self.unblock(target, BlockReason::VmRequestTarget)?;
        self.unblock(origin, BlockReason::VmRequestOrigin)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // IPC
    // ═══════════════════════════════════════════════════════════════

    /// `sender` waits for `dest` to receive; it joins the tail of the
    /// caller queue of `dest`
    pub fn ipc_block_send(&mut self, sender: Endpoint, dest: Endpoint, buffer: u64) -> SchedResult<Transition> {
        let dest_slot = self.table.resolve(dest)?;
        let sender_slot = self.table.resolve(sender)?;
        let pcb = self.table.get_mut(sender_slot)?;
        // one caller queue position per sender
        if pcb.has(BlockReason::Sending) {
            return Err(SchedError::AlreadySending { endpoint: sender });
        }
        pcb.sendto = Some(dest);
        pcb.messbuf = buffer;
        pcb.q_link = None;
        match self.caller_queue_slots(dest_slot).last().copied() {
            Some(last) => {
                if let Some(pcb) = self.table.slot_mut(last) {
                    pcb.q_link = Some(sender_slot);
                }
            }
            None => self.table.get_mut(dest_slot)?.caller_q = Some(sender_slot),
        }
        trace!("{} sends to {}", sender, dest);
        self.block(sender, BlockReason::Sending)
    }

    /// Message delivered; the sender leaves the caller queue
    pub fn ipc_send_complete(&mut self, sender: Endpoint) -> SchedResult<Transition> {
        let sender_slot = self.table.resolve(sender)?;
        let dest = self.table.get(sender_slot)?.sendto;
        if let Some(dest_slot) = dest.and_then(|dest| self.table.resolve(dest).ok()) {
            self.unlink_caller(sender_slot, dest_slot);
        }
        let pcb = self.table.get_mut(sender_slot)?;
        pcb.sendto = None;
        pcb.messbuf = 0;
        self.unblock(sender, BlockReason::Sending)
    }

    /// `receiver` waits for a message, from `from` or from anyone
    pub fn ipc_block_receive(
        &mut self,
        receiver: Endpoint,
        from: Option<Endpoint>,
        buffer: u64,
    ) -> SchedResult<Transition> {
        let pcb = self.table.lookup_mut(receiver)?;
        pcb.getfrom = from;
        pcb.messbuf = buffer;
        self.block(receiver, BlockReason::Receiving)
    }

    pub fn ipc_receive_complete(&mut self, receiver: Endpoint) -> SchedResult<Transition> {
        let pcb = self.table.lookup_mut(receiver)?;
        pcb.getfrom = None;
        pcb.messbuf = 0;
        self.unblock(receiver, BlockReason::Receiving)
    }

    /// Senders blocked on `pid`, oldest first
    pub fn caller_queue(&self, pid: Endpoint) -> SchedResult<Vec<Endpoint>> {
        let slot = self.table.resolve(pid)?;
        Ok(self
            .caller_queue_slots(slot)
            .into_iter()
            .filter_map(|sender| self.table.slot(sender))
            .map(|pcb| pcb.endpoint())
            .collect())
    }

    pub(crate) fn caller_queue_slots(&self, slot: SlotId) -> Vec<SlotId> {
        let head = self.table.slot(slot).and_then(|pcb| pcb.caller_q);
        iter::successors(head, |sender| self.table.slot(*sender).and_then(|pcb| pcb.q_link))
            .take(self.table.capacity())
            .collect()
    }

    /// Take `sender` out of the caller queue of `dest`
    pub(crate) fn unlink_caller(&mut self, sender: SlotId, dest: SlotId) {
        let queue = self.caller_queue_slots(dest);
        let Some(position) = queue.iter().position(|&slot| slot == sender) else {
            return;
        };
        let next = self.table.slot_mut(sender).and_then(|pcb| pcb.q_link.take());
        let owner = match position {
            0 => self.table.slot_mut(dest).map(|pcb| &mut pcb.caller_q),
            _ => self.table.slot_mut(queue[position - 1]).map(|pcb| &mut pcb.q_link),
        };
        if let Some(link) = owner {
            *link = next;
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Signals
    // ═══════════════════════════════════════════════════════════════

    /// A signal arrived for `pid`. A process in the middle of a send gets
    /// `SIG_DELAY` so delivery waits for the send to finish.
    pub fn signal_arrived(&mut self, pid: Endpoint, signo: u8) -> SchedResult<Transition> {
        let pcb = self.table.lookup_mut(pid)?;
        pcb.pending_signals |= 1u64.checked_shl(u32::from(signo)).unwrap_or(0);
        if pcb.has(BlockReason::Sending) {
            pcb.misc |= MiscFlags::SIG_DELAY;
        }
        let slot = pcb.nr;
        let transition = pcb.block(BlockReason::SignalArrived);
        let transition = match pcb.block(BlockReason::SignalPending) {
            Transition::Unchanged => transition,
            other => other,
        };
        self.settle(slot, transition)?;
        Ok(transition)
    }

    /// Hand the pending signal set to the signal manager
    pub fn take_pending_signals(&mut self, pid: Endpoint) -> SchedResult<u64> {
        let pcb = self.table.lookup_mut(pid)?;
        let signals = core::mem::take(&mut pcb.pending_signals);
        self.unblock(pid, BlockReason::SignalArrived)?;
        Ok(signals)
    }

    /// The signal manager finished with `pid`
    pub fn signal_dispatched(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::SignalPending)
    }

    /// Was signal delivery held back by a send? Clears the hold.
    pub fn take_signal_delay(&mut self, pid: Endpoint) -> SchedResult<bool> {
        let pcb = self.table.lookup_mut(pid)?;
        let delayed = pcb.misc.contains(MiscFlags::SIG_DELAY);
        pcb.misc.remove(MiscFlags::SIG_DELAY);
        Ok(delayed)
    }

    // ═══════════════════════════════════════════════════════════════
    // Tracing
    // ═══════════════════════════════════════════════════════════════

    pub fn trace_stop(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.block(pid, BlockReason::Traced)
    }

    pub fn trace_resume(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::Traced)
    }

    pub fn misc_flags(&self, pid: Endpoint) -> SchedResult<MiscFlags> {
        Ok(self.table.lookup(pid)?.misc)
    }

    pub fn set_misc_flags(&mut self, pid: Endpoint, flags: MiscFlags) -> SchedResult<()> {
        self.table.lookup_mut(pid)?.misc.insert(flags);
        Ok(())
    }

    pub fn clear_misc_flags(&mut self, pid: Endpoint, flags: MiscFlags) -> SchedResult<()> {
        self.table.lookup_mut(pid)?.misc.remove(flags);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Process management
    // ═══════════════════════════════════════════════════════════════

    pub fn stop(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.block(pid, BlockReason::Stopped)
    }

    pub fn resume(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::Stopped)
    }

    pub fn grant_privilege(&mut self, pid: Endpoint, privilege: PrivId) -> SchedResult<Transition> {
        self.table.lookup_mut(pid)?.privilege = Some(privilege);
        self.unblock(pid, BlockReason::NoPrivilege)
    }

    pub fn revoke_privilege(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.table.lookup_mut(pid)?.privilege = None;
        self.block(pid, BlockReason::NoPrivilege)
    }

    pub fn sys_lock(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.block(pid, BlockReason::SysLocked)
    }

    pub fn sys_unlock(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock(pid, BlockReason::SysLocked)
    }

    /// Clear every lifecycle hold at once, admitting the process at most once
    pub fn release_holds(&mut self, pid: Endpoint) -> SchedResult<Transition> {
        self.unblock_all(pid, RuntimeFlags::STOPPED | RuntimeFlags::TRACED | RuntimeFlags::SYS_LOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::core::dispatcher::SpawnParams;
    use gsched_abi::{PriorityBounds, SchedConfig};

    fn setup(count: usize) -> (Dispatcher, Vec<Endpoint>) {
        let mut d = Dispatcher::new(SchedConfig::DEFAULT.with_max_processes(8)).unwrap();
        let pids = (0..count)
            .map(|_| d.spawn(SpawnParams::new("p", PrivId(1), PriorityBounds::new(0, 7))).unwrap())
            .collect();
        (d, pids)
    }

    #[test]
    fn test_caller_queue_order_and_exit() {
        let (mut d, pids) = setup(4);
        let server = pids[0];
        for &client in &pids[1..] {
            d.ipc_block_send(client, server, 0x1000).unwrap();
        }
        assert_eq!(d.caller_queue(server).unwrap(), pids[1..].to_vec());

        d.ipc_send_complete(pids[2]).unwrap();
        assert_eq!(d.caller_queue(server).unwrap(), vec![pids[1], pids[3]]);
        assert!(d.process(pids[2]).unwrap().is_runnable());

        // server exit fails the remaining senders
        d.exit(server).unwrap();
        for client in [pids[1], pids[3]] {
            let pcb = d.process(client).unwrap();
            assert!(pcb.is_runnable());
            assert!(pcb.misc.contains(MiscFlags::MSG_FAILED));
            assert_eq!(pcb.sendto, None);
        }
        assert!(d.check_invariants().is_ok());
    }

    #[test]
    fn test_exiting_sender_leaves_caller_queue() {
        let (mut d, pids) = setup(3);
        d.ipc_block_send(pids[1], pids[0], 0).unwrap();
        d.ipc_block_send(pids[2], pids[0], 0).unwrap();
        d.exit(pids[1]).unwrap();
        assert_eq!(d.caller_queue(pids[0]).unwrap(), vec![pids[2]]);
    }

    #[test]
    fn test_second_send_refused() {
        let (mut d, pids) = setup(3);
        d.ipc_block_send(pids[1], pids[0], 0x1000).unwrap();
        d.ipc_block_send(pids[2], pids[0], 0x2000).unwrap();
        assert_eq!(
            d.ipc_block_send(pids[1], pids[0], 0x3000),
            Err(SchedError::AlreadySending { endpoint: pids[1] })
        );
        // queue and sender untouched
        assert_eq!(d.caller_queue(pids[0]).unwrap(), vec![pids[1], pids[2]]);
        assert_eq!(d.process(pids[1]).unwrap().messbuf, 0x1000);
        assert!(d.ipc_block_send(pids[2], pids[1], 0).is_err());
        assert!(d.caller_queue(pids[1]).unwrap().is_empty());

        d.ipc_send_complete(pids[1]).unwrap();
        assert_eq!(d.caller_queue(pids[0]).unwrap(), vec![pids[2]]);
        assert!(d.check_invariants().is_ok());
    }

    #[test]
    fn test_receive_from_exiting_process_fails() {
        let (mut d, pids) = setup(2);
        d.ipc_block_receive(pids[1], Some(pids[0]), 0).unwrap();
        d.exit(pids[0]).unwrap();
        let pcb = d.process(pids[1]).unwrap();
        assert!(pcb.is_runnable());
        assert!(pcb.misc.contains(MiscFlags::MSG_FAILED));
    }

    #[test]
    fn test_signal_flags() {
        let (mut d, pids) = setup(2);
        let pid = pids[1];
        d.ipc_block_send(pid, pids[0], 0).unwrap();
        assert_eq!(d.signal_arrived(pid, 9).unwrap(), Transition::Unchanged);
        assert!(d.misc_flags(pid).unwrap().contains(MiscFlags::SIG_DELAY));

        assert_eq!(d.take_pending_signals(pid).unwrap(), 1 << 9);
        let flags = d.process(pid).unwrap().flags();
        assert!(!flags.contains(RuntimeFlags::SIGNALED));
        assert!(flags.contains(RuntimeFlags::SIG_PENDING));

        d.ipc_send_complete(pid).unwrap();
        assert!(d.take_signal_delay(pid).unwrap());
        assert!(!d.take_signal_delay(pid).unwrap());
        assert_eq!(d.signal_dispatched(pid).unwrap(), Transition::BecameRunnable);
        assert!(d.check_invariants().is_ok());
    }

    #[test]
    fn test_vm_request_blocks_both() {
        let (mut d, pids) = setup(3);
        d.vm_request(pids[1], pids[2]).unwrap();
        assert!(d.process(pids[1]).unwrap().has(BlockReason::VmRequestOrigin));
        assert!(d.process(pids[2]).unwrap().has(BlockReason::VmRequestTarget));
        d.vm_request_done(pids[1], pids[2]).unwrap();
        assert!(d.process(pids[1]).unwrap().is_runnable());
        assert!(d.process(pids[2]).unwrap().is_runnable());
        assert!(d.check_invariants().is_ok());
    }

    #[test]
    fn test_release_holds_admits_once() {
        let (mut d, pids) = setup(2);
        let pid = pids[1];
        d.stop(pid).unwrap();
        d.trace_stop(pid).unwrap();
        d.sys_lock(pid).unwrap();
        assert_eq!(d.release_holds(pid).unwrap(), Transition::BecameRunnable);
        assert_eq!(d.ready_at(7), vec![pid]);
        assert!(d.check_invariants().is_ok());
    }

    #[test]
    fn test_privilege_gate() {
        let (mut d, pids) = setup(1);
        let pid = pids[0];
        assert_eq!(d.revoke_privilege(pid).unwrap(), Transition::BecameBlocked);
        assert_eq!(d.current(), None);
        assert_eq!(d.grant_privilege(pid, PrivId(4)).unwrap(), Transition::BecameRunnable);
        assert_eq!(d.current(), Some(pid));
        assert_eq!(d.process(pid).unwrap().privilege, Some(PrivId(4)));
    }

    #[test]
    fn test_misc_flags_do_not_block() {
        let (mut d, pids) = setup(1);
        d.set_misc_flags(pids[0], MiscFlags::SC_TRACE | MiscFlags::REPLY_PEND).unwrap();
        d.clear_misc_flags(pids[0], MiscFlags::REPLY_PEND).unwrap();
        assert_eq!(d.misc_flags(pids[0]).unwrap(), MiscFlags::SC_TRACE);
        assert!(d.process(pids[0]).unwrap().is_runnable());
    }

    #[test]
    fn test_page_fault_cycle() {
        let (mut d, pids) = setup(1);
        assert_eq!(d.page_fault(pids[0]).unwrap(), Transition::BecameBlocked);
        assert_eq!(d.tick(), None);
        assert_eq!(d.page_fault_resolved(pids[0]).unwrap(), Transition::BecameRunnable);
        assert_eq!(d.current(), Some(pids[0]));
        assert_eq!(d.vm_inhibit(pids[0]).unwrap(), Transition::BecameBlocked);
        assert_eq!(d.page_tables_ready(pids[0]).unwrap(), Transition::BecameRunnable);
    }
}
