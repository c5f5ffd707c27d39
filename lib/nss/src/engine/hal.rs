// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hardware seam: interrupt cause registers and doorbells.
//!
//! Memory mapping, clocks, and firmware loading belong to the platform
//! and sit behind this trait; the driver only ever reads and clears
//! interrupt causes, masks them, and rings the firmware's doorbell.
use crate::api::CoreId;
use bitflags::bitflags;

bitflags! {
    /// Interrupt causes raised by the firmware towards the host.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct N2hIntr: u32 {
        const EMPTY_BUFFER_QUEUE = 1 << 0;
        const DATA_COMMAND_QUEUE = 1 << 1;
        const DATA_QUEUE_1 = 1 << 2;
        /// The firmware is running out of empty buffers.
        const EMPTY_BUFFERS_SOS = 1 << 10;
        /// The firmware drained an H2N ring the host had found full.
        const TX_UNBLOCKED = 1 << 11;
        const COREDUMP_COMPLETE_1 = 1 << 13;
        const COREDUMP_COMPLETE_0 = 1 << 14;
    }
}

bitflags! {
    /// Doorbell causes rung by the host towards the firmware.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct H2nIntr: u32 {
        const EMPTY_BUFFER_QUEUE = 1 << 0;
        const DATA_COMMAND_QUEUE = 1 << 1;
        const RESET = 1 << 10;
        const TX_UNBLOCKED = 1 << 11;
        const TRIGGER_COREDUMP = 1 << 15;
    }
}

/// Platform access to a core's interrupt block.
pub trait Hal: Send + Sync {
    fn read_interrupt_cause(&self, core: CoreId) -> N2hIntr;
    fn clear_interrupt_cause(&self, core: CoreId, cause: N2hIntr);
    fn enable_interrupt(&self, core: CoreId, cause: N2hIntr);
    fn disable_interrupt(&self, core: CoreId, cause: N2hIntr);
    /// Ring the doorbell for the H2N ring identified by `int_bit`.
    fn send_interrupt(&self, core: CoreId, int_bit: u8, cause: H2nIntr);
}

#[cfg(any(feature = "test-help", test))]
pub use sim::SimHal;

#[cfg(any(feature = "test-help", test))]
mod sim {
    use super::*;
    use crate::api::NSS_MAX_CORES;
    use crate::ddi::sync::KMutex;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering;

    type Doorbell = Box<dyn Fn(CoreId, u8, H2nIntr) + Send + Sync>;

    /// A register-level stand-in for the interrupt block.
    ///
    /// Causes are latched per core until cleared, the mask is tracked
    /// so tests can see whether servicing re-enabled interrupts, and
    /// every doorbell is recorded and optionally forwarded to a hook
    /// (which is how a simulated firmware learns about new work).
    #[derive(Default)]
    pub struct SimHal {
        cause: [AtomicU32; NSS_MAX_CORES],
        enabled: [AtomicU32; NSS_MAX_CORES],
        doorbells: KMutex<Vec<(CoreId, u8, H2nIntr)>>,
        hook: KMutex<Option<Doorbell>>,
    }

    impl SimHal {
        pub fn new() -> Self {
            Self::default()
        }

        /// Latch a cause as if the firmware had raised it.
        pub fn raise(&self, core: CoreId, cause: N2hIntr) {
            self.cause[core.index()].fetch_or(cause.bits(), Ordering::AcqRel);
        }

        pub fn pending(&self, core: CoreId) -> N2hIntr {
            N2hIntr::from_bits_truncate(
                self.cause[core.index()].load(Ordering::Acquire),
            )
        }

        pub fn enabled(&self, core: CoreId) -> N2hIntr {
            N2hIntr::from_bits_truncate(
                self.enabled[core.index()].load(Ordering::Acquire),
            )
        }

        pub fn doorbells(&self) -> Vec<(CoreId, u8, H2nIntr)> {
            self.doorbells.lock().clone()
        }

        pub fn doorbell_count(&self) -> usize {
            self.doorbells.lock().len()
        }

        pub fn set_hook<F>(&self, f: F)
        where
            F: Fn(CoreId, u8, H2nIntr) + Send + Sync + 'static,
        {
            *self.hook.lock() = Some(Box::new(f));
        }

        pub fn clear_hook(&self) {
            *self.hook.lock() = None;
        }
    }

    impl Hal for SimHal {
        fn read_interrupt_cause(&self, core: CoreId) -> N2hIntr {
            self.pending(core)
        }

        fn clear_interrupt_cause(&self, core: CoreId, cause: N2hIntr) {
            self.cause[core.index()]
                .fetch_and(!cause.bits(), Ordering::AcqRel);
        }

        fn enable_interrupt(&self, core: CoreId, cause: N2hIntr) {
            self.enabled[core.index()].fetch_or(cause.bits(), Ordering::AcqRel);
        }

        fn disable_interrupt(&self, core: CoreId, cause: N2hIntr) {
            self.enabled[core.index()]
                .fetch_and(!cause.bits(), Ordering::AcqRel);
        }

        fn send_interrupt(&self, core: CoreId, int_bit: u8, cause: H2nIntr) {
            self.doorbells.lock().push((core, int_bit, cause));
            if let Some(hook) = self.hook.lock().as_ref() {
                hook(core, int_bit, cause);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn causes_latch_until_cleared() {
        let hal = SimHal::new();
        hal.raise(CoreId::Core0, N2hIntr::DATA_COMMAND_QUEUE);
        hal.raise(CoreId::Core0, N2hIntr::TX_UNBLOCKED);
        assert!(hal.read_interrupt_cause(CoreId::Core1).is_empty());

        let cause = hal.read_interrupt_cause(CoreId::Core0);
        assert_eq!(cause, N2hIntr::DATA_COMMAND_QUEUE | N2hIntr::TX_UNBLOCKED);
        hal.clear_interrupt_cause(CoreId::Core0, N2hIntr::TX_UNBLOCKED);
        assert_eq!(
            hal.read_interrupt_cause(CoreId::Core0),
            N2hIntr::DATA_COMMAND_QUEUE
        );
    }
}
