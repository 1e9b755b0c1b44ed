use sysinfo::Networks;

/// Cumulative received-byte counter of the host's network interfaces.
pub trait InterfaceCounters: Send {
    fn total_received_bytes(&mut self) -> u64;
}

/// `sysinfo` backed counters summed over every interface.
pub struct SystemCounters {
    networks: Networks,
}

impl SystemCounters {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceCounters for SystemCounters {
    fn total_received_bytes(&mut self) -> u64 {
        // 网卡可能热插拔，刷新列表
        self.networks.refresh_list();
        (&self.networks).into_iter().map(|(_, data)| data.total_received()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_counters_never_go_backwards_between_reads() {
        let mut counters = SystemCounters::new();
        let a = counters.total_received_bytes();
        let b = counters.total_received_bytes();
        assert!(b >= a);
    }
}
