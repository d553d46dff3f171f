use super::sample::{SamplePair, SensorPacket, Vector3};

/// Raw event from one of the two motion sensors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    Accelerometer(Vector3),
    Gyroscope(Vector3),
}

/// Pairs accelerometer and gyroscope events and batches the pairs into packets
///
/// Pairing is by arrival order: the latest accelerometer reading is held until
/// the next gyroscope reading, then both are emitted together. A gyroscope
/// reading with no pending accelerometer reading is dropped. If one sensor
/// stalls or the two arrive out of the expected order, pairs can mix readings
/// taken at noticeably different times; no timestamp correlation is attempted.
pub struct SensorFusion {
    samples_per_packet: usize,
    pending_accel: Option<Vector3>,
    buffer: Vec<SamplePair>,
}

impl SensorFusion {
    pub fn new(samples_per_packet: usize) -> Self {
        let samples_per_packet = samples_per_packet.max(1);
        Self {
            samples_per_packet,
            pending_accel: None,
            buffer: Vec::with_capacity(samples_per_packet),
        }
    }

    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    /// Number of pairs waiting for the packet to fill
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one event; returns a packet once exactly `samples_per_packet` pairs are buffered
    pub fn push(&mut self, event: SensorEvent) -> Option<SensorPacket> {
        match event {
            SensorEvent::Accelerometer(reading) => {
                self.pending_accel = Some(reading);
                None
            }
            SensorEvent::Gyroscope(gyro) => {
                let accel = self.pending_accel.take()?;
                self.buffer.push(SamplePair::new(accel, gyro));

                if self.buffer.len() < self.samples_per_packet {
                    return None;
                }

                let pairs = std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.samples_per_packet),
                );
                Some(SensorPacket::new(pairs))
            }
        }
    }

    /// Discard the partial packet and any unpaired accelerometer reading
    pub fn reset(&mut self) {
        self.pending_accel = None;
        self.buffer.clear();
    }
}
