//! The driver facade: owns the serial threads, boots the controller,
//! interviews and binds units through the device-info catalog, and is the
//! surface the host driver calls into.

use crate::ccimpl::admin;
use crate::device_info::DevInfoCatalog;
use crate::error::{Error, Result};
use crate::fields::{FieldId, FieldStore, FieldValue, FieldWriteRes};
use crate::scheduler::Scheduler;
use crate::timings::SchedTimings;
use crate::units::{Unit, UnitConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use zwusb_core::prelude::*;
use zwusb_core::security::keys::{NetworkKey, DEFAULT_NETWORK_KEY};
use zwusb_logging::ImmutableLogger;
use zwusb_serial::link::{FrameReader, FrameWriter};
use zwusb_serial::raw::{open_port, RawRead, RawWrite};

/// How long the bootstrap waits for each controller-local response.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an interview waits for the manufacturer report.
const INTERVIEW_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ZwDriverConfig {
    pub network_key: NetworkKey,
    pub device_info_dir: Option<PathBuf>,
    pub timings: SchedTimings,
    pub logger: Option<Arc<dyn ImmutableLogger>>,
}

impl Default for ZwDriverConfig {
    fn default() -> Self {
        Self {
            network_key: DEFAULT_NETWORK_KEY,
            device_info_dir: None,
            timings: SchedTimings::default(),
            logger: None,
        }
    }
}

/// What the controller reported about itself at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerIds {
    pub home_id: u32,
    pub node_id: NodeId,
}

pub struct ZwDriver {
    sched: Arc<Scheduler>,
    catalog: DevInfoCatalog,
    threads: Mutex<Vec<JoinHandle<()>>>,
    ids: Mutex<Option<ControllerIds>>,
}

impl ZwDriver {
    pub fn new(fields: Arc<dyn FieldStore>, config: ZwDriverConfig) -> Result<Self> {
        let catalog = match &config.device_info_dir {
            Some(dir) => DevInfoCatalog::load(dir)?,
            None => DevInfoCatalog::empty(),
        };
        let sched = Scheduler::new(fields, config.network_key, config.timings, config.logger);
        Ok(Self {
            sched,
            catalog,
            threads: Mutex::new(Vec::new()),
            ids: Mutex::new(None),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn catalog(&self) -> &DevInfoCatalog {
        &self.catalog
    }

    /// Open the USB stick and start the reader and writer threads.
    pub fn start_on_port(&self, path: &str) -> Result<()> {
        let (rx, tx) = open_port(path)?;
        self.start_io(rx, tx);
        Ok(())
    }

    /// Start the two runtime threads over the given byte link.
    pub fn start_io(&self, rx: Box<dyn RawRead>, tx: Box<dyn RawWrite>) {
        let writer = FrameWriter::new(tx, self.sched.link(), self.sched.wakeup());
        let reader = FrameReader::new(rx);

        let mut threads = self.threads.lock().expect("driver lock poisoned");
        let sched = self.sched.clone();
        threads.push(std::thread::spawn(move || sched.run_writer(writer)));
        let sched = self.sched.clone();
        threads.push(std::thread::spawn(move || sched.run_reader(reader)));
    }

    /// The startup conversation with the stick: timeouts, our NIF, then
    /// home and node id. Returns the node ids the stick knows about.
    pub fn bootstrap(&self) -> Result<Vec<NodeId>> {
        self.sched
            .request_response(admin::build_set_serial_api_timeouts(0x0f, 0x0a), BOOTSTRAP_TIMEOUT)?;
        self.sched
            .request_response(admin::build_get_capabilities(), BOOTSTRAP_TIMEOUT)?;
        self.sched
            .request_response(admin::build_appl_node_information(true), BOOTSTRAP_TIMEOUT)
            // Some sticks never answer this one; that is fine
            .ok();

        let reply = self
            .sched
            .request_response(admin::build_get_controller_id(), BOOTSTRAP_TIMEOUT)?;
        let payload = reply.payload();
        if payload.len() < 5 {
            return Err(Error::Config("short controller id response".into()));
        }
        let ids = ControllerIds {
            home_id: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            node_id: NodeId::new(payload[4]),
        };
        self.sched.set_own_node_id(ids.node_id);
        *self.ids.lock().expect("driver lock poisoned") = Some(ids);

        let reply = self
            .sched
            .request_response(admin::build_get_init_data(), BOOTSTRAP_TIMEOUT)?;
        Ok(decode_init_data_nodes(reply.payload(), ids.node_id))
    }

    pub fn controller_ids(&self) -> Option<ControllerIds> {
        *self.ids.lock().expect("driver lock poisoned")
    }

    /// Interview one node: protocol info for its listener class, then the
    /// manufacturer id, then the catalog bind. Sleepers answer the
    /// manufacturer query only at their next wakeup, hence the long wait.
    pub fn interview_and_bind(&self, node: NodeId, name: &str) -> Result<()> {
        let reply = self
            .sched
            .request_response(admin::build_get_node_protocol_info(node), BOOTSTRAP_TIMEOUT)?;
        let listener = admin::decode_protocol_info(reply.payload())
            .ok_or_else(|| Error::Config("short protocol info response".into()))?;

        self.sched.enqueue(admin::build_manufacturer_specific_get(node));
        let manufacturer = self.wait_manufacturer(node)?;

        let mut config = UnitConfig::new(node, name, listener);
        config.manufacturer = manufacturer;
        self.bind_unit(config)
    }

    fn wait_manufacturer(&self, node: NodeId) -> Result<ManufacturerId> {
        let deadline = Instant::now() + INTERVIEW_TIMEOUT;
        let wakeup = self.sched.wakeup();
        loop {
            let seen = wakeup.generation();
            if let Some(id) = self.sched.take_manufacturer_report(node) {
                return Ok(id);
            }
            if self.sched.is_stopping() {
                return Err(Error::Stopping);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            wakeup.wait_past(seen, deadline);
        }
    }

    /// Bind a unit whose manufacturer id is already known: look up the
    /// device info, build the impl set, and queue the auto-config writes.
    pub fn bind_unit(&self, config: UnitConfig) -> Result<()> {
        let fields = self.fields_of_sched();
        let dev_info = self.catalog.lookup(config.manufacturer)?;
        let node = config.node;
        let unit = Unit::prepare(config, dev_info, fields.as_ref())?;

        let controller = self
            .controller_ids()
            .map(|ids| ids.node_id)
            .unwrap_or_else(|| NodeId::new(1));
        let bootstrap = unit.bootstrap_msgs(controller);
        let version_gets: Vec<_> = unit
            .dev_info()
            .ccs
            .iter()
            .map(|cc| admin::build_version_cc_get(node, cc.class))
            .collect();
        let wants_endpoints = unit.dev_info().unit_class == "NCHOutlet";

        self.sched.add_unit(unit);
        for msg in bootstrap {
            self.sched.enqueue(msg);
        }
        for msg in version_gets {
            self.sched.enqueue(msg);
        }
        if wants_endpoints {
            self.sched.enqueue(admin::build_endpoint_count_get(node));
        }
        Ok(())
    }

    fn fields_of_sched(&self) -> Arc<dyn FieldStore> {
        self.sched.fields()
    }

    /// Host write entry point.
    pub fn write_field(&self, field_id: FieldId, value: &FieldValue) -> FieldWriteRes {
        self.sched.write_field(field_id, value)
    }

    /// Cancel everything and join both threads.
    pub fn shutdown(&self) {
        self.sched.shutdown();
        let mut threads = self.threads.lock().expect("driver lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ZwDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode the GetSerialApiInitData node bitmask: version, capabilities,
/// bitmask length, then one bit per node id starting at 1.
fn decode_init_data_nodes(payload: &[u8], own: NodeId) -> Vec<NodeId> {
    let Some(&mask_len) = payload.get(2) else {
        return Vec::new();
    };
    let Some(mask) = payload.get(3..3 + mask_len as usize) else {
        return Vec::new();
    };

    let mut nodes = Vec::new();
    for (byte_index, byte) in mask.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                let id = NodeId::new((byte_index * 8 + bit + 1) as u8);
                if id != own {
                    nodes.push(id);
                }
            }
        }
    }
    nodes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_init_data_nodes() {
        // version 5, caps 0, 29-byte mask with nodes 1, 2 and 10 set
        let mut payload = vec![0x05, 0x00, 29];
        payload.extend_from_slice(&[0u8; 29]);
        payload[3] = 0b0000_0011; // nodes 1 and 2
        payload[4] = 0b0000_0010; // node 10
        let nodes = decode_init_data_nodes(&payload, NodeId::new(1));
        assert_eq!(nodes, vec![NodeId::new(2), NodeId::new(10)]);
    }

    #[test]
    fn test_decode_init_data_truncated() {
        assert!(decode_init_data_nodes(&[0x05], NodeId::new(1)).is_empty());
        assert!(decode_init_data_nodes(&[0x05, 0x00, 29, 0x01], NodeId::new(1)).is_empty());
    }
}
