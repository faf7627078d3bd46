//! Device-class registry and device discovery.
//!
//! The platform hands the bus a static table of device classes, then reports
//! devices to it: a run of MMIO windows through [`VirtioBus::mmio_detect`] or
//! single PCI functions through [`VirtioBus::add_pci_device`]. Each device
//! whose class accepts it is kept behind its own lock, shared between the
//! submission path ([`VirtioBus::with_device`]) and the interrupt path
//! ([`VirtioBus::handle_irq`]).

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{HandlerReturn, VirtioDevice};
use crate::transport::mmio::{MmioTransport, MMIO_WINDOW_SIZE};
use crate::transport::pci::{PciFunction, PciTransport};
use crate::transport::Transport;
use crate::{Result, VirtioError};

/// Driver for one VirtIO device type.
pub struct VirtioDevClass {
    /// VirtIO device ID this class binds to.
    pub device_id: u32,
    pub name: &'static str,
    /// One-time setup, run by [`VirtioBus::module_init`].
    pub module_init: Option<fn()>,
    /// Bind to a freshly reset device. An error drops the device.
    pub init: fn(&mut VirtioDevice) -> Result<()>,
    /// Bring a bound device online.
    pub startup: Option<fn(&mut VirtioDevice) -> Result<()>>,
}

/// Every VirtIO device the platform has reported.
pub struct VirtioBus {
    classes: &'static [VirtioDevClass],
    devices: Vec<Mutex<VirtioDevice>>,
}

impl VirtioBus {
    pub const fn new(classes: &'static [VirtioDevClass]) -> Self {
        Self {
            classes,
            devices: Vec::new(),
        }
    }

    /// Run every class' one-time setup.
    pub fn module_init(&self) {
        for class in self.classes {
            if let Some(module_init) = class.module_init {
                log::debug!("[VirtIO] module init: {}", class.name);
                module_init();
            }
        }
    }

    pub fn find_class(&self, device_id: u32) -> Option<&'static VirtioDevClass> {
        self.classes.iter().find(|class| class.device_id == device_id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Scan `count` consecutive MMIO windows starting at `base`.
    ///
    /// Window `i` uses interrupt `irqs[i]` (0 when `irqs` is shorter). Returns
    /// the number of devices a class accepted and kept on the bus.
    ///
    /// # Safety
    ///
    /// `base` must map `count * MMIO_WINDOW_SIZE` bytes of register windows
    /// that stay mapped for the lifetime of the bus.
    pub unsafe fn mmio_detect(&mut self, base: *mut u8, count: usize, irqs: &[u32]) -> usize {
        let first = self.devices.len();
        let mut found = 0;

        for i in 0..count {
            let window = base.add(i * MMIO_WINDOW_SIZE);
            let mmio = match MmioTransport::probe(window) {
                Ok(mmio) => mmio,
                Err(err) => {
                    log::debug!("[VirtIO MMIO] window {} at {:p}: {}", i, window, err);
                    continue;
                }
            };

            let irq = irqs.get(i).copied().unwrap_or(0);
            log::info!(
                "[VirtIO MMIO] window {}: device {} version {} irq {}",
                i,
                mmio.device_id(),
                mmio.version(),
                irq
            );

            let mut dev = VirtioDevice::new(i, irq, Transport::Mmio(mmio));
            if self.bind(&mut dev).is_ok() {
                self.devices.push(Mutex::new(dev));
                found += 1;
            }
        }

        for slot in &self.devices[first..] {
            let mut dev = slot.lock();
            if let Err(err) = self.start(&mut dev) {
                log::warn!("[VirtIO] device {} startup failed: {}", dev.index(), err);
            }
        }

        found
    }

    /// Register one PCI function; returns its slot on the bus.
    pub fn add_pci_device(&mut self, pci: Box<dyn PciFunction>) -> Result<usize> {
        let mut transport = PciTransport::new(pci)?;
        let irq = transport.allocate_irq()?;
        log::info!(
            "[VirtIO PCI] device {:#06x} (type {}) irq {}",
            transport.pci_device_id(),
            transport.device_id(),
            irq
        );

        let index = self.devices.len();
        let mut dev = VirtioDevice::new(index, irq, Transport::Pci(transport));
        self.bind(&mut dev)?;
        self.start(&mut dev)?;

        self.devices.push(Mutex::new(dev));
        Ok(index)
    }

    fn bind(&self, dev: &mut VirtioDevice) -> Result<()> {
        let device_id = dev.transport().device_id();
        let class = self.find_class(device_id).ok_or_else(|| {
            log::info!("[VirtIO] no driver for device type {}", device_id);
            VirtioError::NoDevice
        })?;

        dev.reset_device();
        (class.init)(dev).map_err(|err| {
            log::warn!("[VirtIO] {}: init of device {} failed: {}", class.name, dev.index(), err);
            err
        })
    }

    fn start(&self, dev: &mut VirtioDevice) -> Result<()> {
        match self.find_class(dev.transport().device_id()).and_then(|class| class.startup) {
            Some(startup) => startup(dev),
            None => Ok(()),
        }
    }

    /// Run `f` on the device in `slot` with its lock held.
    ///
    /// The interrupt path takes the same lock. On a single CPU the caller
    /// must mask the device's interrupt for the duration of the call, or an
    /// interrupt arriving inside `f` spins on the lock forever.
    pub fn with_device<R>(&self, slot: usize, f: impl FnOnce(&mut VirtioDevice) -> R) -> Option<R> {
        let mut dev = self.devices.get(slot)?.lock();
        Some(f(&mut dev))
    }

    /// Platform interrupt entry: service every device wired to `irq`.
    ///
    /// Locks each device in turn. Must not run while this CPU is inside
    /// [`VirtioBus::with_device`] on this bus; see there.
    pub fn handle_irq(&self, irq: u32) -> HandlerReturn {
        let mut ret = HandlerReturn::NoReschedule;
        for slot in &self.devices {
            let mut dev = slot.lock();
            if dev.irq() == irq {
                ret |= dev.handle_irq();
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_id;
    use crate::ring::UsedElem;
    use crate::status::{DeviceStatus, InterruptStatus};
    use crate::testing::{DeviceModel, FakeMmioWindow, FakePciFunction};
    use crate::transport::mmio::regs;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct BlockState {
        completions: Vec<UsedElem>,
        started: bool,
    }

    fn block_init(dev: &mut VirtioDevice) -> Result<()> {
        dev.status_acknowledge_driver();
        dev.alloc_ring(0, 8)?;
        dev.set_driver_data(BlockState::default());
        dev.set_irq_driver_callback(block_complete);
        Ok(())
    }

    fn block_startup(dev: &mut VirtioDevice) -> Result<()> {
        dev.driver_data_mut::<BlockState>().ok_or(VirtioError::InitFailed)?.started = true;
        dev.status_driver_ok();
        Ok(())
    }

    fn block_complete(dev: &mut VirtioDevice, ring: usize, elem: &UsedElem) -> HandlerReturn {
        dev.free_desc_chain(ring, elem.id as u16);
        if let Some(state) = dev.driver_data_mut::<BlockState>() {
            state.completions.push(*elem);
        }
        HandlerReturn::Reschedule
    }

    fn net_init(dev: &mut VirtioDevice) -> Result<()> {
        dev.status_acknowledge_driver();
        Ok(())
    }

    fn reject_init(_dev: &mut VirtioDevice) -> Result<()> {
        Err(VirtioError::InitFailed)
    }

    static CLASSES: [VirtioDevClass; 2] = [
        VirtioDevClass {
            device_id: device_id::BLOCK,
            name: "virtio-blk",
            module_init: None,
            init: block_init,
            startup: Some(block_startup),
        },
        VirtioDevClass {
            device_id: device_id::NET,
            name: "virtio-net",
            module_init: None,
            init: net_init,
            startup: None,
        },
    ];

    #[test]
    fn test_mmio_detect_skips_invalid_windows() {
        let mut windows = FakeMmioWindow::empty(6);
        windows.install(0, 2, device_id::BLOCK);
        // Window 1 stays blank: no magic value.
        windows.install(2, 3, device_id::BLOCK);
        windows.install(3, 2, device_id::INVALID);
        windows.install(4, 1, device_id::NET);
        windows.install(5, 2, device_id::ENTROPY_SRC);

        let mut bus = VirtioBus::new(&CLASSES);
        let found = unsafe { bus.mmio_detect(windows.base(), 6, &[40, 41, 42, 43, 44]) };

        // Entropy is a valid device but has no driver, so only two are kept.
        assert_eq!(found, 2);
        assert_eq!(bus.device_count(), 2);

        let (index, irq, started) = bus
            .with_device(0, |dev| {
                (dev.index(), dev.irq(), dev.driver_data::<BlockState>().unwrap().started)
            })
            .unwrap();
        assert_eq!((index, irq, started), (0, 40, true));
        assert_eq!(windows.get_at(0, regs::STATUS), 7);

        let (index, irq, legacy) = bus
            .with_device(1, |dev| (dev.index(), dev.irq(), dev.mmio().unwrap().is_legacy()))
            .unwrap();
        assert_eq!((index, irq, legacy), (4, 44, true));
        assert_eq!(windows.get_at(4, regs::STATUS), 3);

        assert!(bus.with_device(2, |_| ()).is_none());
    }

    #[test]
    fn test_mmio_detect_resets_before_init() {
        let mut windows = FakeMmioWindow::empty(1);
        windows.install(0, 2, device_id::NET);
        windows.set(regs::STATUS, DeviceStatus::FAILED.bits() as u32);

        let mut bus = VirtioBus::new(&CLASSES);
        assert_eq!(unsafe { bus.mmio_detect(windows.base(), 1, &[]) }, 1);
        assert_eq!(windows.get(regs::STATUS), 3);
        assert_eq!(bus.with_device(0, |dev| dev.irq()), Some(0));
    }

    static REJECT_STARTUPS: AtomicUsize = AtomicUsize::new(0);

    fn count_reject_startup(_dev: &mut VirtioDevice) -> Result<()> {
        REJECT_STARTUPS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    static REJECTING: [VirtioDevClass; 1] = [VirtioDevClass {
        device_id: device_id::CONSOLE,
        name: "virtio-console",
        module_init: None,
        init: reject_init,
        startup: Some(count_reject_startup),
    }];

    #[test]
    fn test_mmio_detect_drops_rejected_devices() {
        let mut windows = FakeMmioWindow::empty(2);
        windows.install(0, 2, device_id::CONSOLE);
        windows.install(1, 2, device_id::CONSOLE);

        let mut bus = VirtioBus::new(&REJECTING);
        assert_eq!(unsafe { bus.mmio_detect(windows.base(), 2, &[5, 6]) }, 0);
        assert_eq!(bus.device_count(), 0);
        assert_eq!(REJECT_STARTUPS.load(Ordering::SeqCst), 0);
    }

    static MODULE_INITS: AtomicUsize = AtomicUsize::new(0);

    fn count_module_init() {
        MODULE_INITS.fetch_add(1, Ordering::SeqCst);
    }

    static WITH_MODULE_INIT: [VirtioDevClass; 3] = [
        VirtioDevClass {
            device_id: device_id::BLOCK,
            name: "virtio-blk",
            module_init: Some(count_module_init),
            init: block_init,
            startup: None,
        },
        VirtioDevClass {
            device_id: device_id::NET,
            name: "virtio-net",
            module_init: None,
            init: net_init,
            startup: None,
        },
        VirtioDevClass {
            device_id: device_id::GPU,
            name: "virtio-gpu",
            module_init: Some(count_module_init),
            init: net_init,
            startup: None,
        },
    ];

    #[test]
    fn test_module_init_runs_each_class_hook() {
        let bus = VirtioBus::new(&WITH_MODULE_INIT);
        bus.module_init();
        assert_eq!(MODULE_INITS.load(Ordering::SeqCst), 2);
        assert_eq!(bus.find_class(device_id::GPU).map(|c| c.name), Some("virtio-gpu"));
        assert!(bus.find_class(device_id::INPUT).is_none());
    }

    #[test]
    fn test_add_pci_device() {
        let fake = FakePciFunction::new(0x1af4, 0x1042);
        let mut bus = VirtioBus::new(&CLASSES);

        assert_eq!(bus.add_pci_device(Box::new(fake)), Ok(0));
        let (irq, status, on_pci, ring_active) = bus
            .with_device(0, |dev| (dev.irq(), dev.status(), dev.pci().is_some(), dev.is_ring_active(0)))
            .unwrap();
        assert_eq!(irq, 32);
        assert_eq!(status.bits(), 7);
        assert!(on_pci);
        assert!(ring_active);
    }

    #[test]
    fn test_add_pci_device_failures_register_nothing() {
        let mut bus = VirtioBus::new(&CLASSES);

        let foreign = FakePciFunction::new(0x8086, 0x1042);
        assert_eq!(bus.add_pci_device(Box::new(foreign)), Err(VirtioError::NotVirtio));

        let no_irq = FakePciFunction::new(0x1af4, 0x1042).with_irq(None);
        assert_eq!(bus.add_pci_device(Box::new(no_irq)), Err(VirtioError::IrqUnavailable));

        let no_driver = FakePciFunction::new(0x1af4, 0x1044);
        assert_eq!(bus.add_pci_device(Box::new(no_driver)), Err(VirtioError::NoDevice));

        let no_caps = FakePciFunction::without_capabilities(0x1042);
        assert_eq!(bus.add_pci_device(Box::new(no_caps)), Err(VirtioError::MissingCapability));

        assert_eq!(bus.device_count(), 0);
    }

    #[test]
    fn test_handle_irq_routes_by_line() {
        let mut windows = FakeMmioWindow::empty(2);
        windows.install(0, 2, device_id::BLOCK);
        windows.install(1, 2, device_id::BLOCK);

        let mut bus = VirtioBus::new(&CLASSES);
        assert_eq!(unsafe { bus.mmio_detect(windows.base(), 2, &[5, 6]) }, 2);

        let mut device = bus.with_device(1, |dev| DeviceModel::attach(dev.ring(0))).unwrap();
        windows.set_at(1, regs::QUEUE_NOTIFY, 0xffff);
        let head = bus
            .with_device(1, |dev| {
                let (head, mut desc) = dev.alloc_desc_chain(0, 2).unwrap();
                desc.set_buffer(0x4000, 512, true);
                dev.submit_chain(0, head);
                dev.kick(0);
                head
            })
            .unwrap();
        assert_eq!(windows.get_at(1, regs::QUEUE_NOTIFY), 0);
        assert_eq!(device.poll_avail(), Some(head));
        device.complete(head, 512);
        windows.set_at(1, regs::INTERRUPT_STATUS, InterruptStatus::USED_BUFFER.bits());

        // Wrong line: nothing consumed.
        assert_eq!(bus.handle_irq(5), HandlerReturn::NoReschedule);
        assert_eq!(bus.handle_irq(6), HandlerReturn::Reschedule);
        assert_eq!(windows.get_at(1, regs::INTERRUPT_ACK), 1);

        let (completions, free) = bus
            .with_device(1, |dev| {
                let state = dev.driver_data::<BlockState>().unwrap();
                (state.completions.clone(), dev.ring(0).free_count())
            })
            .unwrap();
        assert_eq!(completions, [UsedElem { id: head as u32, len: 512 }]);
        assert_eq!(free, 8);
        assert!(bus
            .with_device(0, |dev| dev.driver_data::<BlockState>().unwrap().completions.is_empty())
            .unwrap());
    }
}
