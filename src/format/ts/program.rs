use log::debug;

use super::psi::build_scte35_null;
use super::section::Section;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    pid: u16,
    pmt_index: Option<u32>,
}

/// A program: one PMT describing a set of elementary streams that share a
/// clock reference.
#[derive(Debug)]
pub struct Program {
    number: u16,
    pmt_pid: u16,
    pub(crate) pmt_version: u8,
    pub(crate) pmt_changed: bool,
    pub(crate) next_pmt_pcr: Option<u64>,
    pmt_interval: u64,
    pub(crate) pmt_section: Option<Section>,

    members: Vec<Member>,
    pub(crate) pcr_pid: Option<u16>,

    scte35_pid: Option<u16>,
    scte35_null_interval: u64,
    pub(crate) next_scte35_pcr: Option<u64>,
    pub(crate) scte35_null_section: Option<Section>,

    pub(crate) wrote_si: bool,
}

impl Program {
    pub(crate) fn new(number: u16, pmt_pid: u16, pmt_interval: u64, scte35_null_interval: u64) -> Self {
        Self {
            number,
            pmt_pid,
            pmt_version: 0,
            pmt_changed: true,
            next_pmt_pcr: None,
            pmt_interval,
            pmt_section: None,
            members: Vec::new(),
            pcr_pid: None,
            scte35_pid: None,
            scte35_null_interval,
            next_scte35_pcr: None,
            scte35_null_section: None,
            wrote_si: false,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn pmt_pid(&self) -> u16 {
        self.pmt_pid
    }

    /// Version of the PMT currently being repeated.
    pub fn pmt_version(&self) -> u8 {
        self.pmt_version
    }

    pub fn pmt_interval(&self) -> u64 {
        self.pmt_interval
    }

    pub(crate) fn set_pmt_interval(&mut self, interval: u64) {
        self.pmt_interval = interval;
    }

    pub fn pcr_pid(&self) -> Option<u16> {
        self.pcr_pid
    }

    pub fn scte35_pid(&self) -> Option<u16> {
        self.scte35_pid
    }

    pub fn scte35_null_interval(&self) -> u64 {
        self.scte35_null_interval
    }

    pub(crate) fn set_scte35_null_interval(&mut self, interval: u64) {
        self.scte35_null_interval = interval;
    }

    /// Whether this program's PMT has gone out at least once.
    pub fn wrote_si(&self) -> bool {
        self.wrote_si
    }

    pub(crate) fn set_scte35_pid(&mut self, pid: Option<u16>) -> Result<()> {
        self.scte35_null_section = match pid {
            Some(pid) => Some(Section::new(pid, build_scte35_null())?),
            None => None,
        };
        self.scte35_pid = pid;
        self.next_scte35_pcr = None;
        self.pmt_changed = true;
        Ok(())
    }

    /// Member PIDs in PMT order: indexed streams by ascending index, then the
    /// rest by ascending PID.
    pub fn stream_pids(&self) -> Vec<u16> {
        self.members.iter().map(|m| m.pid).collect()
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.members.iter().any(|m| m.pid == pid)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn add_stream(&mut self, pid: u16, pmt_index: Option<u32>) {
        let member = Member { pid, pmt_index };
        let position = self
            .members
            .iter()
            .position(|m| match (member.pmt_index, m.pmt_index) {
                (Some(new), Some(existing)) => new < existing,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => pid < m.pid,
            })
            .unwrap_or(self.members.len());
        self.members.insert(position, member);
        self.pmt_changed = true;
        debug!("program {}: added stream 0x{:04x}", self.number, pid);
    }

    /// Removes `pid`, returning true when it was a member.
    pub(crate) fn remove_stream(&mut self, pid: u16) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.pid != pid);
        let removed = self.members.len() != before;
        if removed {
            self.pmt_changed = true;
            debug!("program {}: removed stream 0x{:04x}", self.number, pid);
        }
        removed
    }

    /// Forces the PMT to be rebuilt, with a new version, on the next pass.
    pub fn resend_pmt(&mut self) {
        self.pmt_changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pmt_order() {
        let mut program = Program::new(1, 0x20, 9000, 450_000);
        program.add_stream(0x45, None);
        program.add_stream(0x41, None);
        program.add_stream(0x50, Some(2));
        program.add_stream(0x60, Some(0));
        program.add_stream(0x43, None);
        assert_eq!(program.stream_pids(), vec![0x60, 0x50, 0x41, 0x43, 0x45]);
    }

    #[test]
    fn test_remove_stream() {
        let mut program = Program::new(1, 0x20, 9000, 450_000);
        program.add_stream(0x41, None);
        program.pmt_changed = false;
        assert!(!program.remove_stream(0x42));
        assert!(!program.pmt_changed);
        assert!(program.remove_stream(0x41));
        assert!(program.pmt_changed);
        assert!(program.is_empty());
    }

    #[test]
    fn test_scte35_pid() {
        let mut program = Program::new(1, 0x20, 9000, 450_000);
        program.set_scte35_pid(Some(0x1f0)).unwrap();
        assert_eq!(program.scte35_pid(), Some(0x1f0));
        let section = program.scte35_null_section.as_ref().unwrap();
        assert_eq!(section.pid(), 0x1f0);
        assert_eq!(section.table_id(), 0xfc);
        program.set_scte35_pid(None).unwrap();
        assert!(program.scte35_null_section.is_none());
    }
}
