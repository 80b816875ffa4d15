use log::{debug, info};

use crate::client::{HiloClient, HiloError};
use crate::device::Device;
use crate::models::hilo::{gateway_descriptor, DeviceDescriptor, DeviceId, RawAttributes};

/// Devices known to the bridge, in discovery order. At most one per id.
#[derive(Debug, Default)]
pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    /// Update the device with this id in place, or append a new one.
    pub fn upsert(
        &mut self,
        desc: &DeviceDescriptor,
        device_url: String,
        synthesized: Option<RawAttributes>,
    ) -> &mut Device {
        let idx = match self.devices.iter().position(|d| d.id() == &desc.id) {
            Some(idx) => idx,
            None => {
                debug!("New device {} ({})", desc.id, desc.device_type);
                self.devices.push(Device::new(desc.id.clone()));
                self.devices.len() - 1
            }
        };
        let device = &mut self.devices[idx];
        device.apply_descriptor(desc, device_url, synthesized);
        device
    }

    /// Pull the device list and the gateway, creating or updating devices.
    pub fn refresh_all(&mut self, client: &mut HiloClient) -> Result<(), HiloError> {
        let base = client.location_url(false)?;
        let descriptors = client.device_list()?;
        for desc in &descriptors {
            self.upsert(desc, format!("{}/Devices/{}", base, desc.id), None);
        }

        let location = client.location_id()?;
        let info = client.gateway_info()?;
        let gateway = gateway_descriptor(&location);
        let url = format!("{}/Devices/{}", base, gateway.id);
        self.upsert(&gateway, url, Some(info.to_attributes()));

        info!("Registry holds {} device(s)", self.devices.len());
        Ok(())
    }
}
