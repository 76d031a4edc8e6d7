use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Raw intensity, its background and where it bleaches
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceChannel {
    pub int: Vec<f64>,
    pub bg: Vec<f64>,
    pub bleach: Option<usize>,
}

impl TraceChannel {
    pub fn new(int: Vec<f64>, bg: Vec<f64>) -> Self {
        Self { int, bg, bleach: None }
    }

    /// Zero background
    pub fn from_intensity(int: Vec<f64>) -> Self {
        let bg = vec![0.0; int.len()];
        Self { int, bg, bleach: None }
    }

    pub fn len(&self) -> usize {
        self.int.len()
    }

    pub fn is_empty(&self) -> bool {
        self.int.is_empty()
    }

    /// Background corrected intensity
    pub fn corrected(&self) -> Vec<f64> {
        self.int.iter().zip(&self.bg).map(|(i, b)| i - b).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Green, // Donor emission, donor excitation
    Acceptor, // Acceptor emission, donor excitation
    Red, // Acceptor emission, acceptor excitation
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Green => "green",
            Channel::Acceptor => "acceptor",
            Channel::Red => "red",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "green" | "grn" | "donor" => Ok(Channel::Green),
            "acceptor" | "acc" => Ok(Channel::Acceptor),
            "red" => Ok(Channel::Red),
            _ => Err(ConfigError::UnknownMode { kind: "channel", mode: s.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrected_intensity() {
        let channel = TraceChannel::new(vec![10.0, 12.0], vec![2.0, 3.0]);
        assert_eq!(channel.corrected(), vec![8.0, 9.0]);
        assert_eq!(TraceChannel::from_intensity(vec![1.0; 3]).bg, vec![0.0; 3]);
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("Red".parse::<Channel>().unwrap(), Channel::Red);
        assert_eq!("grn".parse::<Channel>().unwrap(), Channel::Green);
        assert!("blue".parse::<Channel>().is_err());
    }
}
