//! Typed register access over a transport
//!
//! [`RegisterCoder`] turns descriptor lists into block reads, decodes each
//! descriptor on its own (one bad value never hides the others) and keeps a
//! small cache so descriptors with a `max_age` are not re-read while fresh.
//! The cache holds raw words, so descriptors that share registers but differ
//! in format or scale each decode their own value from it.

use std::collections::HashMap;
use std::time::Duration;

use mb_register::{Access, CodecError, ReadPlanner, RegisterDescriptor, Value};
use tokio::time::Instant;
use tracing::trace;

use crate::client::Request;
use crate::error::BusError;
use crate::handle::TransportHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    unit: u8,
    access: Access,
    address: u16,
    count: u16,
}

impl CacheKey {
    fn new(unit: u8, reg: &RegisterDescriptor) -> Self {
        Self {
            unit,
            access: reg.access,
            address: reg.address,
            count: reg.count(),
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    words: Vec<u16>,
    read_at: Instant,
}

/// Reads and writes typed registers
#[derive(Debug, Clone, Default)]
pub struct RegisterCoder {
    planner: ReadPlanner,
    timeout: Option<Duration>,
    cache: HashMap<CacheKey, Cached>,
}

impl RegisterCoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom planner (block size, barriers)
    pub fn with_planner(planner: ReadPlanner) -> Self {
        Self {
            planner,
            ..Self::default()
        }
    }

    /// Response timeout for every request issued by this coder
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn planner(&self) -> &ReadPlanner {
        &self.planner
    }

    /// Read `regs` from `unit`
    ///
    /// Returns one decode result per descriptor, in input order. Transport
    /// level failures (timeout, exception, closed link) abort the whole read.
    pub async fn read(
        &mut self,
        handle: &TransportHandle,
        unit: u8,
        regs: &[RegisterDescriptor],
    ) -> Result<Vec<Result<Value, CodecError>>, BusError> {
        let now = Instant::now();
        let mut results: Vec<Option<Result<Value, CodecError>>> = vec![None; regs.len()];
        let mut stale = Vec::new();

        for (i, reg) in regs.iter().enumerate() {
            match self.fresh(unit, reg, now) {
                Some(decoded) => results[i] = Some(decoded),
                None => stale.push(i),
            }
        }

        for block in self.planner.plan(regs, stale) {
            let mut request = Request::read(unit, block.access, block.start, block.count);
            if let Some(timeout) = self.timeout {
                request = request.with_timeout(timeout);
            }

            let words = handle
                .execute(request)
                .await?
                .into_registers()
                .unwrap_or_default();
            trace!(
                "unit {} {} {}+{}: {} words",
                unit,
                block.access,
                block.start,
                block.count,
                words.len()
            );

            let read_at = Instant::now();
            for &i in &block.members {
                let reg = &regs[i];
                let decoded = match block.slice(reg, &words) {
                    Some(own) => {
                        let decoded = reg.decode(own);
                        if decoded.is_ok() {
                            self.cache.insert(
                                CacheKey::new(unit, reg),
                                Cached {
                                    words: own.to_vec(),
                                    read_at,
                                },
                            );
                        }
                        decoded
                    }
                    None => Err(CodecError::WrongCount {
                        expected: reg.count(),
                        actual: words.len().saturating_sub((reg.address - block.start) as usize),
                    }),
                };
                results[i] = Some(decoded);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or(Err(CodecError::WrongCount { expected: 0, actual: 0 })))
            .collect())
    }

    /// Read a single descriptor
    pub async fn read_one(
        &mut self,
        handle: &TransportHandle,
        unit: u8,
        reg: &RegisterDescriptor,
    ) -> Result<Value, BusError> {
        let mut results = self.read(handle, unit, std::slice::from_ref(reg)).await?;
        match results.pop() {
            Some(result) => Ok(result?),
            None => Err(CodecError::WrongCount {
                expected: reg.count(),
                actual: 0,
            }
            .into()),
        }
    }

    /// Encode and write one value, bypassing the cache
    pub async fn write(
        &mut self,
        handle: &TransportHandle,
        unit: u8,
        reg: &RegisterDescriptor,
        value: &Value,
    ) -> Result<(), BusError> {
        let words = reg.encode(value)?;
        let mut request = Request::write(unit, reg.address, words);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        self.cache.remove(&CacheKey::new(unit, reg));
        handle.execute(request).await?;
        Ok(())
    }

    /// Forget every cached value
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    fn fresh(
        &self,
        unit: u8,
        reg: &RegisterDescriptor,
        now: Instant,
    ) -> Option<Result<Value, CodecError>> {
        let max_age = reg.max_age?;
        let cached = self.cache.get(&CacheKey::new(unit, reg))?;
        if now.saturating_duration_since(cached.read_at) < max_age {
            Some(reg.decode(&cached.words))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, FakeUnit};
    use crate::{BusMode, Endpoint, TransportConfig, TransportRegistry};
    use std::sync::Arc;

    async fn setup(unit: FakeUnit) -> (FakeBus, Arc<TransportHandle>) {
        let bus = FakeBus::new();
        bus.add_unit(9600, 2, unit);
        let registry = TransportRegistry::new(Arc::new(bus.clone()), TransportConfig::default());
        let handle = registry
            .acquire(&Endpoint::serial("/dev/ttyFAKE0", 9600, BusMode::Rtu))
            .await
            .unwrap();
        (bus, handle)
    }

    fn meter() -> FakeUnit {
        FakeUnit::new()
            .with_registers(0x0000, &[0x4366, 0x0000]) // 230.0 V
            .with_registers(0x0006, &[0x4120, 0x0000]) // 10.0 A
            .with_registers(0x000c, &[0x4500, 0x0000]) // 2048.0 W
            .with_register(0x001c, 16384)
    }

    #[tokio::test]
    async fn test_block_read_decodes_in_input_order() {
        let (bus, handle) = setup(meter()).await;
        let regs = vec![
            RegisterDescriptor::f32_be(0x000c),
            RegisterDescriptor::f32_be(0x0000),
            RegisterDescriptor::f32_be(0x0006),
        ];

        let mut coder = RegisterCoder::new();
        let values = coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(values[0], Ok(Value::Float(2048.0)));
        assert_eq!(values[1], Ok(Value::Float(230.0)));
        assert_eq!(values[2], Ok(Value::Float(10.0)));

        // 0..2 and 6..8 and 12..14 are not contiguous
        assert_eq!(bus.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_contiguous_registers_share_one_request() {
        let unit = FakeUnit::new().with_registers(0, &[1, 2, 3, 4]);
        let (bus, handle) = setup(unit).await;
        let regs = vec![
            RegisterDescriptor::u16(0),
            RegisterDescriptor::u16(1),
            RegisterDescriptor::u32_be(2),
        ];

        let values = RegisterCoder::new().read(&handle, 2, &regs).await.unwrap();
        assert_eq!(values[2], Ok(Value::Int(0x0003_0004)));
        assert_eq!(bus.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_per_descriptor() {
        let unit = FakeUnit::new().with_registers(0, &[1, 2]).truncate_reads(1);
        let (_bus, handle) = setup(unit).await;
        let regs = vec![RegisterDescriptor::u16(0), RegisterDescriptor::u16(1)];

        let values = RegisterCoder::new().read(&handle, 2, &regs).await.unwrap();
        assert_eq!(values[0], Ok(Value::Int(1)));
        assert!(matches!(values[1], Err(CodecError::WrongCount { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_skips_fresh_values() {
        let (bus, handle) = setup(meter()).await;
        let regs = vec![RegisterDescriptor::f32_be(0x0000).with_max_age(Duration::from_secs(5))];
        let mut coder = RegisterCoder::new();

        coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(bus.calls().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let values = coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(values[0], Ok(Value::Float(230.0)));
        assert_eq!(bus.calls().len(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(bus.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_words_decode_per_descriptor() {
        let unit = FakeUnit::new().with_register(0, 100);
        let (bus, handle) = setup(unit).await;
        let max_age = Duration::from_secs(5);
        let regs = vec![
            RegisterDescriptor::u16(0).with_scale(10.0).with_max_age(max_age),
            RegisterDescriptor::u16(0).with_max_age(max_age),
            RegisterDescriptor::s16(0).with_scale(100.0).with_max_age(max_age),
        ];
        let mut coder = RegisterCoder::new();

        let first = coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(first[0], Ok(Value::Float(10.0)));
        assert_eq!(first[1], Ok(Value::Int(100)));
        assert_eq!(first[2], Ok(Value::Float(1.0)));
        assert_eq!(bus.calls().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(bus.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_max_age_always_reads() {
        let (bus, handle) = setup(meter()).await;
        let regs = vec![RegisterDescriptor::u16(0x001c)];
        let mut coder = RegisterCoder::new();

        coder.read(&handle, 2, &regs).await.unwrap();
        coder.read(&handle, 2, &regs).await.unwrap();
        assert_eq!(bus.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_read() {
        let (_bus, handle) = setup(meter()).await;
        let mut coder = RegisterCoder::new().with_timeout(Duration::from_millis(100));

        let err = coder
            .read(&handle, 5, &[RegisterDescriptor::u16(0x001c)])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (bus, handle) = setup(meter()).await;
        let reg = RegisterDescriptor::u16(0x0100).with_scale(10.0);
        let mut coder = RegisterCoder::new();

        coder.write(&handle, 2, &reg, &Value::Float(5.0)).await.unwrap();
        assert_eq!(bus.register(9600, 2, 0x0100), Some(50));
        assert_eq!(
            coder.read_one(&handle, 2, &reg).await.unwrap(),
            Value::Float(5.0)
        );

        let err = coder
            .write(&handle, 2, &RegisterDescriptor::u16(0).input(), &Value::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Codec(CodecError::ReadOnly(_))));
    }
}
