use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by whoever owns the loop policies. The loop owns the tick and
/// the policy turns it into `TickerEvents`, so logic stays decoupled from data.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u8 {
        /// The runtime is shutting down, the worker must exit its loop.
        const SHUTDOWN = 1;

        /// Scan injectors from the lowest priority class up, so background
        /// work is not starved by a steady stream of interactive work.
        const LOWEST_PRIORITY_FIRST = 1 << 1;
    }
}
