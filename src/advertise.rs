//! Local-network advertisement (mDNS/DNS-SD)
//!
//! Publishes the handshake endpoint on the local network so patient agents
//! can find the broker without the directory. TXT keys stay within the
//! RFC 6763 9-character limit: `npi` (organization NPI), `ver` (protocol
//! version), `ep` (handshake endpoint URL). Unregistering on shutdown sends
//! the goodbye (TTL=0) announcements before the listener closes.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

use crate::server::protocol::PROTOCOL_VERSION;
use crate::types::{NeuronError, Result};

pub struct Advertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertiser {
    /// Start advertising `_<service_name>._tcp` as `neuron-<npi>`.
    pub fn start(
        service_name: &str,
        organization_npi: &str,
        handshake_url: &str,
        port: u16,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| NeuronError::Internal(format!("mDNS daemon failed to start: {e}")))?;

        let service_type = format!("_{}._tcp.local.", service_name);
        let instance_name = format!("neuron-{}", organization_npi);
        let host_name = format!("{}.local.", instance_name);
        let txt = [
            ("npi", organization_npi),
            ("ver", PROTOCOL_VERSION),
            ("ep", handshake_url),
        ];

        let service = ServiceInfo::new(&service_type, &instance_name, &host_name, "", port, &txt[..])
            .map_err(|e| NeuronError::Internal(format!("mDNS service info invalid: {e}")))?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        daemon
            .register(service)
            .map_err(|e| NeuronError::Internal(format!("mDNS registration failed: {e}")))?;

        info!(
            instance = %instance_name,
            service_type = %service_type,
            "Advertising handshake endpoint over mDNS"
        );

        Ok(Self { daemon, fullname })
    }

    /// Send goodbye announcements and stop the daemon.
    pub fn shutdown(self) {
        match self.daemon.unregister(&self.fullname) {
            Ok(receiver) => {
                // Wait briefly for the goodbye packets to go out.
                let _ = receiver.recv_timeout(std::time::Duration::from_secs(2));
            }
            Err(e) => warn!("mDNS unregister failed: {e}"),
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS daemon shutdown failed: {e}");
        }
        info!("mDNS advertisement withdrawn");
    }
}
