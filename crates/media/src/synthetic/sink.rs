use std::sync::{Arc, Mutex, MutexGuard};

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::synthetic::LifecycleLog;

use crate::codec::{Packet, PacketSink, StreamParameters};
use crate::rational::Rational;

/// Everything a [`MemorySink`] received.
#[derive(Debug, Clone, Default)]
pub struct SinkRecord {
    pub params: Option<StreamParameters>,
    pub packets: Vec<Packet>,
    pub trailers: usize,
    pub closed: bool,
}

/// Shared view of a sink's record.
#[derive(Debug, Clone, Default)]
pub struct SinkHandle {
    record: Arc<Mutex<SinkRecord>>,
}

impl SinkHandle {
    fn lock(&self) -> MutexGuard<'_, SinkRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SinkRecord {
        self.lock().clone()
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.lock().packets.clone()
    }

    pub fn packet_count(&self) -> usize {
        self.lock().packets.len()
    }

    /// Packet payloads in write order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock().packets.iter().map(|p| p.data.clone()).collect()
    }

    pub fn trailers(&self) -> usize {
        self.lock().trailers
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Muxer that keeps packets in memory.
pub struct MemorySink {
    handle: SinkHandle,
    time_base: Rational,
    began: bool,
    log: Option<LifecycleLog>,
}

impl MemorySink {
    pub fn new(time_base: Rational) -> Self {
        Self {
            handle: SinkHandle::default(),
            time_base,
            began: false,
            log: None,
        }
    }

    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }
}

impl PacketSink for MemorySink {
    fn begin(&mut self, params: &StreamParameters) -> CutlineResult<()> {
        if self.began {
            return Err(CutlineError::container("stream already started"));
        }
        self.began = true;
        self.handle.lock().params = Some(params.clone());
        Ok(())
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn write_packet(&mut self, packet: Packet) -> CutlineResult<()> {
        let mut record = self.handle.lock();
        if !self.began || record.trailers > 0 || record.closed {
            return Err(CutlineError::container(
                "packet written outside the header/trailer window",
            ));
        }
        if packet.time_base != self.time_base {
            return Err(CutlineError::container(format!(
                "packet in {} but container uses {}",
                packet.time_base, self.time_base
            )));
        }
        record.packets.push(packet);
        Ok(())
    }

    fn write_trailer(&mut self) -> CutlineResult<()> {
        let mut record = self.handle.lock();
        if record.closed {
            return Err(CutlineError::container("trailer written after close"));
        }
        record.trailers += 1;
        Ok(())
    }

    fn close(&mut self) -> CutlineResult<()> {
        let mut record = self.handle.lock();
        if !record.closed {
            record.closed = true;
            if let Some(log) = &self.log {
                log.record("sink.close");
            }
        }
        Ok(())
    }
}
