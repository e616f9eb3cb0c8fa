use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::plan::ClientMode;

/// Radio duty-cycling driver compiled into the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RdcDriver {
    ContikiMac,
    NullRdc,
    Cxmac,
}

impl RdcDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            RdcDriver::ContikiMac => "contikimac",
            RdcDriver::NullRdc => "nullrdc",
            RdcDriver::Cxmac => "cxmac",
        }
    }

    /// Symbol passed to the firmware build (`RDC=<symbol>`).
    pub fn driver_symbol(&self) -> String {
        format!("{}_driver", self.as_str())
    }
}

impl fmt::Display for RdcDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RdcDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contikimac" => Ok(RdcDriver::ContikiMac),
            "nullrdc" => Ok(RdcDriver::NullRdc),
            "cxmac" => Ok(RdcDriver::Cxmac),
            other => Err(format!(
                "unknown RDC driver '{other}'. Try 'contikimac', 'nullrdc' or 'cxmac'."
            )),
        }
    }
}

/// Parameters of the separate-response protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeparateParams {
    /// Ack mode requested from the server (`sep=<ack>`).
    pub ack: u32,
    /// Server-side wait before the separate response, in server units.
    pub wait: u32,
}

/// Key identifying one experiment configuration.
///
/// Field order doubles as the report sort order: hops, payload, driver, then
/// the separate-response parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParameterTuple {
    pub hops: u32,
    pub payload: u32,
    pub rdc: RdcDriver,
    pub separate: Option<SeparateParams>,
}

impl ParameterTuple {
    pub fn simple(hops: u32, payload: u32, rdc: RdcDriver) -> Self {
        Self {
            hops,
            payload,
            rdc,
            separate: None,
        }
    }

    pub fn separate(hops: u32, payload: u32, rdc: RdcDriver, ack: u32, wait: u32) -> Self {
        Self {
            hops,
            payload,
            rdc,
            separate: Some(SeparateParams { ack, wait }),
        }
    }

    pub fn is_separate(&self) -> bool {
        self.separate.is_some()
    }

    pub fn mode(&self) -> ClientMode {
        if self.is_separate() {
            ClientMode::Separate
        } else {
            ClientMode::Simple
        }
    }

    /// Device numbers of the participating hops, nearest first.
    ///
    /// Device 1 is the border router, so hop `h` sits on device `h + 1`.
    pub fn nodes(&self) -> RangeInclusive<u32> {
        2..=self.hops + 1
    }

    /// Device addressed by the protocol client.
    pub fn target_node(&self) -> u32 {
        self.hops + 1
    }

    /// Result-file name. Encodes every field so the store needs no index.
    pub fn file_name(&self) -> String {
        match self.separate {
            None => format!(
                "hops{}_payload{}_rdc{}.txt",
                self.hops, self.payload, self.rdc
            ),
            Some(sep) => format!(
                "hops{}_payload{}_ack{}_wait{}_rdc{}.txt",
                self.hops, self.payload, sep.ack, sep.wait, self.rdc
            ),
        }
    }

    /// Recover a tuple from a result-file name.
    ///
    /// Also accepts the older separate-response naming without a payload
    /// component (`hops2_ack1_wait30_rdccontikimac.txt`), read as payload 0.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".txt")?;
        let parts: Vec<&str> = stem.split('_').collect();
        let hops = numeric_field(parts.first()?, "hops")?;
        let rdc: RdcDriver = parts.last()?.strip_prefix("rdc")?.parse().ok()?;
        match parts.len() {
            3 => Some(Self::simple(hops, numeric_field(parts[1], "payload")?, rdc)),
            4 => Some(Self::separate(
                hops,
                0,
                rdc,
                numeric_field(parts[1], "ack")?,
                numeric_field(parts[2], "wait")?,
            )),
            5 => Some(Self::separate(
                hops,
                numeric_field(parts[1], "payload")?,
                rdc,
                numeric_field(parts[2], "ack")?,
                numeric_field(parts[3], "wait")?,
            )),
            _ => None,
        }
    }
}

fn numeric_field(part: &str, token: &str) -> Option<u32> {
    part.strip_prefix(token)?.parse().ok()
}

impl fmt::Display for ParameterTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.separate {
            None => write!(f, "({},{},{})", self.hops, self.payload, self.rdc),
            Some(sep) => write!(
                f,
                "({},{},ack={},wait={},{})",
                self.hops, self.payload, sep.ack, sep.wait, self.rdc
            ),
        }
    }
}
