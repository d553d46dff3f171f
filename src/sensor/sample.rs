use std::fmt;

/// One three-axis reading
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn parse(text: &str, index: usize) -> Result<Self, PacketError> {
        let mut axes = [0.0f32; 3];
        let mut count = 0;

        for part in text.split(',') {
            if count == 3 {
                return Err(PacketError::AxisCount { index });
            }
            axes[count] = part.trim().parse().map_err(|_| PacketError::Number {
                index,
                value: part.to_string(),
            })?;
            count += 1;
        }

        if count != 3 {
            return Err(PacketError::AxisCount { index });
        }

        Ok(Self::new(axes[0], axes[1], axes[2]))
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// One accelerometer reading matched with the gyroscope reading that followed it
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplePair {
    pub accel: Vector3,
    pub gyro: Vector3,
}

impl SamplePair {
    pub fn new(accel: Vector3, gyro: Vector3) -> Self {
        Self { accel, gyro }
    }

    /// `[acc.x, acc.y, acc.z, gyro.x, gyro.y, gyro.z]`
    pub fn to_array(&self) -> [f32; 6] {
        [
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
        ]
    }
}

impl fmt::Display for SamplePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.accel, self.gyro)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PacketError {
    #[error("packet is empty")]
    Empty,

    #[error("pair {index} has no gyroscope part")]
    MissingGyro { index: usize },

    #[error("pair {index} does not have exactly three axes")]
    AxisCount { index: usize },

    #[error("pair {index} has a non-numeric value {value:?}")]
    Number { index: usize, value: String },
}

/// A batch of sample pairs sent as one `/sensor_data` message
///
/// Wire form: `acc.x,acc.y,acc.z;gyro.x,gyro.y,gyro.z` pairs joined by `|`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorPacket {
    pairs: Vec<SamplePair>,
}

impl SensorPacket {
    pub fn new(pairs: Vec<SamplePair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[SamplePair] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<SamplePair> {
        self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(SamplePair::to_string)
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn parse(text: &str) -> Result<Self, PacketError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PacketError::Empty);
        }

        let pairs = text
            .split('|')
            .enumerate()
            .map(|(index, pair)| {
                let (accel, gyro) = pair
                    .split_once(';')
                    .ok_or(PacketError::MissingGyro { index })?;
                Ok(SamplePair::new(
                    Vector3::parse(accel, index)?,
                    Vector3::parse(gyro, index)?,
                ))
            })
            .collect::<Result<Vec<_>, PacketError>>()?;

        Ok(Self { pairs })
    }
}
