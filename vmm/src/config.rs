// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::result;
use std::str::FromStr;

use arch::x86_64::tdx::cpuid::{FeatureAdjustments, FeatureListError};
use hypervisor::TDX_MEASUREMENT_SIZE;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEMORY_MB: u64 = 512;
/// MigTD attributes used when binding, unless configured.
pub const DEFAULT_MIGTD_ATTR: u64 = 0x0000_07ff_0000_0001;

/// Errors associated with VM configuration parameters.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Error parsing --cpus: {0}")]
    ParseCpus(#[source] OptionParserError),
    #[error("Error parsing --cpus: invalid feature list: {0}")]
    ParseCpuFeatures(#[source] FeatureListError),
    #[error("Error parsing --memory: {0}")]
    ParseMemory(#[source] OptionParserError),
    #[error("Error parsing --tdx: {0}")]
    ParseTdx(#[source] OptionParserError),
    #[error("Error parsing --tdx: {0} must be {1} hexadecimal digits")]
    ParseTdxMeasurement(String, usize),
    #[error("Error parsing --tdx: invalid quote generation service address: {0}")]
    ParseQuoteEndpoint(String),
    #[error("Error parsing --tdx: firmware missing")]
    ParseTdxFirmwareMissing,
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("At least one vCPU is required")]
    CpusZero,
    #[error("Memory size {0:#x} is not a multiple of the page size")]
    MemoryUnaligned(u64),
    #[error("Memory size is zero")]
    MemoryZero,
    #[error("Firmware image {0:?} not found")]
    FirmwareMissing(PathBuf),
    #[error("Invalid TSC frequency: {0}")]
    TscFrequency(#[source] crate::tdx::TdxError),
    #[error("Migration destination requires TDX")]
    IncomingWithoutTdx,
}

type ValidationResult<T> = result::Result<T, ValidationError>;

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String, String),
}

type OptionParserResult<T> = result::Result<T, OptionParserError>;

// Splits on commas outside of `[...]`, so list values can carry commas.
fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list = Vec::new();
    let mut depth = 0u32;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| OptionParserError::InvalidSyntax(s.to_owned()))?;
            }
            ',' if depth == 0 => {
                list.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if depth != 0 {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }
    list.push(current);

    Ok(list)
}

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, Option<String>>,
}

impl OptionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| OptionParserError::InvalidSyntax(option.to_owned()))?;
            let slot = self
                .options
                .get_mut(name)
                .ok_or_else(|| OptionParserError::UnknownOption(name.to_owned()))?;
            *slot = Some(value.trim().to_owned());
        }

        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        self.options.insert(option.to_owned(), None);
        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.clone())
            .filter(|s| !s.is_empty())
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options.get(option).is_some_and(|v| v.is_some())
    }

    pub fn convert<T: FromStr>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.get(option) {
            None => Ok(None),
            Some(v) => T::from_str(&v)
                .map(Some)
                .map_err(|_| OptionParserError::Conversion(option.to_owned(), v)),
        }
    }
}

pub struct Toggle(pub bool);

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "true" => Ok(Toggle(true)),
            "off" | "false" => Ok(Toggle(false)),
            _ => Err(s.to_owned()),
        }
    }
}

pub struct ByteSized(pub u64);

impl FromStr for ByteSized {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        let s = s.trim();
        let shift = match s.chars().last() {
            Some('K') => 10,
            Some('M') => 20,
            Some('G') => 30,
            _ => 0,
        };
        let v = s
            .trim_end_matches(['K', 'M', 'G'])
            .parse::<u64>()
            .map_err(|_| s.to_owned())?;
        v.checked_shl(shift)
            .filter(|r| r >> shift == v)
            .map(ByteSized)
            .ok_or_else(|| s.to_owned())
    }
}

/// An integer in decimal or `0x` prefixed hexadecimal.
pub struct Integer(pub u64);

impl FromStr for Integer {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(Integer),
            None => s.parse().map(Integer),
        }
    }
}

/// A SHA384 value, written as 96 hexadecimal digits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha384(pub [u8; TDX_MEASUREMENT_SIZE]);

impl Sha384 {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for Sha384 {
    fn default() -> Self {
        Sha384([0; TDX_MEASUREMENT_SIZE])
    }
}

impl fmt::Debug for Sha384 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Sha384 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        let mut v = [0u8; TDX_MEASUREMENT_SIZE];
        hex::decode_to_slice(s, &mut v)?;
        Ok(Sha384(v))
    }
}

impl Serialize for Sha384 {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Sha384 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha384::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Where the quote generation service listens.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum QuoteEndpoint {
    Unix(PathBuf),
    Inet(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

impl FromStr for QuoteEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::ParseQuoteEndpoint(s.to_owned());
        let (kind, addr) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "unix" if !addr.is_empty() => Ok(QuoteEndpoint::Unix(PathBuf::from(addr))),
            "inet" => addr
                .to_socket_addrs()
                .ok()
                .and_then(|mut a| a.next())
                .map(QuoteEndpoint::Inet)
                .ok_or_else(invalid),
            "vsock" => {
                let (cid, port) = addr.split_once(':').ok_or_else(invalid)?;
                Ok(QuoteEndpoint::Vsock {
                    cid: cid.parse().map_err(|_| invalid())?,
                    port: port.parse().map_err(|_| invalid())?,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for QuoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QuoteEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            QuoteEndpoint::Inet(addr) => write!(f, "inet:{addr}"),
            QuoteEndpoint::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuFeatures(pub FeatureAdjustments);

impl Serialize for CpuFeatures {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for CpuFeatures {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map(CpuFeatures)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    /// Expose the PMU, which also sets the TD PERFMON attribute.
    #[serde(default)]
    pub pmu: bool,
    /// Leave power management to the guest.
    #[serde(default)]
    pub cpu_pm: bool,
    #[serde(default)]
    pub host_tsx_broken: bool,
    #[serde(default)]
    pub features: CpuFeatures,
}

impl CpusConfig {
    pub fn parse(cpus: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("boot")
            .add("pmu")
            .add("cpu_pm")
            .add("host_tsx_broken")
            .add("features");
        parser.parse(cpus).map_err(Error::ParseCpus)?;

        let boot_vcpus = parser
            .convert("boot")
            .map_err(Error::ParseCpus)?
            .unwrap_or(DEFAULT_VCPUS);
        let toggle = |name| -> Result<bool> {
            Ok(parser
                .convert::<Toggle>(name)
                .map_err(Error::ParseCpus)?
                .unwrap_or(Toggle(false))
                .0)
        };
        let features = match parser.get("features") {
            Some(list) => CpuFeatures(
                list.trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse()
                    .map_err(Error::ParseCpuFeatures)?,
            ),
            None => CpuFeatures::default(),
        };

        Ok(CpusConfig {
            boot_vcpus,
            pmu: toggle("pmu")?,
            cpu_pm: toggle("cpu_pm")?,
            host_tsx_broken: toggle("host_tsx_broken")?,
            features,
        })
    }
}

impl Default for CpusConfig {
    fn default() -> Self {
        CpusConfig {
            boot_vcpus: DEFAULT_VCPUS,
            pmu: false,
            cpu_pm: false,
            host_tsx_broken: false,
            features: CpuFeatures::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryConfig {
    pub size: u64,
}

impl MemoryConfig {
    pub fn parse(memory: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("size");
        parser.parse(memory).map_err(Error::ParseMemory)?;

        let size = parser
            .convert::<ByteSized>("size")
            .map_err(Error::ParseMemory)?
            .unwrap_or(ByteSized(DEFAULT_MEMORY_MB << 20))
            .0;

        Ok(MemoryConfig { size })
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            size: DEFAULT_MEMORY_MB << 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TdxConfig {
    pub firmware: PathBuf,
    #[serde(default = "default_true")]
    pub sept_ve_disable: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub mrconfigid: Sha384,
    #[serde(default)]
    pub mrowner: Sha384,
    #[serde(default)]
    pub mrownerconfig: Sha384,
    #[serde(default)]
    pub quote_generation_service: Option<QuoteEndpoint>,
    #[serde(default)]
    pub migtd_pid: u32,
    #[serde(default)]
    pub migtd_hash: Sha384,
    #[serde(default = "default_migtd_attr")]
    pub migtd_attr: u64,
    #[serde(default)]
    pub vsockport: Option<u32>,
    /// Accept the GetQuote shapes of older guest drivers.
    #[serde(default = "default_true")]
    pub legacy_quote_abi: bool,
}

fn default_true() -> bool {
    true
}

fn default_migtd_attr() -> u64 {
    DEFAULT_MIGTD_ATTR
}

impl TdxConfig {
    pub fn new(firmware: PathBuf) -> Self {
        TdxConfig {
            firmware,
            sept_ve_disable: true,
            debug: false,
            mrconfigid: Sha384::default(),
            mrowner: Sha384::default(),
            mrownerconfig: Sha384::default(),
            quote_generation_service: None,
            migtd_pid: 0,
            migtd_hash: Sha384::default(),
            migtd_attr: DEFAULT_MIGTD_ATTR,
            vsockport: None,
            legacy_quote_abi: true,
        }
    }

    pub fn parse(tdx: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("firmware")
            .add("sept_ve_disable")
            .add("debug")
            .add("mrconfigid")
            .add("mrowner")
            .add("mrownerconfig")
            .add("quote_generation_service")
            .add("migtd_pid")
            .add("migtd_hash")
            .add("migtd_attr")
            .add("vsockport")
            .add("legacy_quote_abi");
        parser.parse(tdx).map_err(Error::ParseTdx)?;

        let firmware = parser
            .get("firmware")
            .map(PathBuf::from)
            .ok_or(Error::ParseTdxFirmwareMissing)?;
        let mut config = TdxConfig::new(firmware);

        let toggle = |name, default| -> Result<bool> {
            Ok(parser
                .convert::<Toggle>(name)
                .map_err(Error::ParseTdx)?
                .map(|t| t.0)
                .unwrap_or(default))
        };
        config.sept_ve_disable = toggle("sept_ve_disable", true)?;
        config.debug = toggle("debug", false)?;
        config.legacy_quote_abi = toggle("legacy_quote_abi", true)?;

        let sha384 = |name: &str| -> Result<Sha384> {
            match parser.get(name) {
                Some(v) => v.parse().map_err(|_| {
                    Error::ParseTdxMeasurement(name.to_owned(), TDX_MEASUREMENT_SIZE * 2)
                }),
                None => Ok(Sha384::default()),
            }
        };
        config.mrconfigid = sha384("mrconfigid")?;
        config.mrowner = sha384("mrowner")?;
        config.mrownerconfig = sha384("mrownerconfig")?;
        config.migtd_hash = sha384("migtd_hash")?;

        config.quote_generation_service = parser
            .get("quote_generation_service")
            .map(|s| s.parse())
            .transpose()?;
        config.migtd_pid = parser
            .convert("migtd_pid")
            .map_err(Error::ParseTdx)?
            .unwrap_or(0);
        config.migtd_attr = parser
            .convert::<Integer>("migtd_attr")
            .map_err(Error::ParseTdx)?
            .map(|i| i.0)
            .unwrap_or(DEFAULT_MIGTD_ATTR);
        config.vsockport = parser.convert("vsockport").map_err(Error::ParseTdx)?;

        Ok(config)
    }

    /// A MigTD is bound by pid, or pre-bound by hash.
    pub fn migtd_configured(&self) -> bool {
        self.migtd_pid != 0 || !self.migtd_hash.is_zero()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    #[serde(default)]
    pub cpus: CpusConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tsc_khz: Option<u32>,
    /// The VM waits for its state from a migration source.
    #[serde(default)]
    pub incoming: bool,
    #[serde(default)]
    pub tdx: Option<TdxConfig>,
}

pub struct VmParams<'a> {
    pub cpus: &'a str,
    pub memory: &'a str,
    pub tdx: Option<&'a str>,
    pub tsc_khz: Option<u32>,
    pub incoming: bool,
}

impl VmConfig {
    pub fn parse(vm_params: VmParams) -> Result<Self> {
        let tdx = vm_params.tdx.map(TdxConfig::parse).transpose()?;

        Ok(VmConfig {
            cpus: CpusConfig::parse(vm_params.cpus)?,
            memory: MemoryConfig::parse(vm_params.memory)?,
            tsc_khz: vm_params.tsc_khz,
            incoming: vm_params.incoming,
            tdx,
        })
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.cpus.boot_vcpus == 0 {
            return Err(ValidationError::CpusZero);
        }
        if self.memory.size == 0 {
            return Err(ValidationError::MemoryZero);
        }
        if self.memory.size % arch::PAGE_SIZE as u64 != 0 {
            return Err(ValidationError::MemoryUnaligned(self.memory.size));
        }

        match &self.tdx {
            Some(tdx) => {
                if !tdx.firmware.is_file() {
                    return Err(ValidationError::FirmwareMissing(tdx.firmware.clone()));
                }
                crate::tdx::check_tsc_frequency(self.tsc_khz.unwrap_or(0))
                    .map_err(ValidationError::TscFrequency)?;
            }
            None if self.incoming => return Err(ValidationError::IncomingWithoutTdx),
            None => {}
        }

        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            cpus: CpusConfig::default(),
            memory: MemoryConfig::default(),
            tsc_khz: None,
            incoming: false,
            tdx: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use arch::x86_64::tdx::cpuid::FeatureWord;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_option_parser() -> result::Result<(), OptionParserError> {
        let mut parser = OptionParser::new();
        parser.add("size").add("features");

        assert!(parser.parse("size=128M,hanging_param").is_err());
        assert!(parser.parse("size=128M,unknown=1").is_err());
        assert!(parser.parse("features=[+pku,-avx").is_err());
        assert!(parser.parse("size=128M,features=[+pku,-avx512f]").is_ok());

        assert_eq!(parser.get("size"), Some("128M".to_owned()));
        assert_eq!(parser.get("features"), Some("[+pku,-avx512f]".to_owned()));
        assert!(parser.is_set("size"));
        Ok(())
    }

    #[test]
    fn test_cpu_parsing() -> Result<()> {
        assert_eq!(CpusConfig::parse("")?, CpusConfig::default());

        let cpus = CpusConfig::parse("boot=4,pmu=on,features=[+avx512f,-pku]")?;
        assert_eq!(cpus.boot_vcpus, 4);
        assert!(cpus.pmu);
        assert!(!cpus.cpu_pm);
        assert_ne!(cpus.features.0.plus[FeatureWord::Leaf7_0Ebx], 0);
        assert_ne!(cpus.features.0.minus[FeatureWord::Leaf7_0Ecx], 0);

        assert!(CpusConfig::parse("pmu=maybe").is_err());
        assert!(CpusConfig::parse("features=[avx512f]").is_err());
        Ok(())
    }

    #[test]
    fn test_mem_parsing() -> Result<()> {
        assert_eq!(MemoryConfig::parse("")?, MemoryConfig::default());
        assert_eq!(MemoryConfig::parse("size=2G")?.size, 2 << 30);
        assert_eq!(MemoryConfig::parse("size=4096")?.size, 4096);
        assert!(MemoryConfig::parse("size=12Q").is_err());
        Ok(())
    }

    #[test]
    fn test_tdx_parsing() -> Result<()> {
        assert!(matches!(
            TdxConfig::parse("debug=on"),
            Err(Error::ParseTdxFirmwareMissing)
        ));

        let tdx = TdxConfig::parse("firmware=/tmp/TDVF.fd")?;
        assert_eq!(tdx, TdxConfig::new(PathBuf::from("/tmp/TDVF.fd")));
        assert!(tdx.sept_ve_disable);
        assert!(tdx.legacy_quote_abi);
        assert_eq!(tdx.migtd_attr, DEFAULT_MIGTD_ATTR);
        assert!(!tdx.migtd_configured());

        let hash = "ab".repeat(TDX_MEASUREMENT_SIZE);
        let tdx = TdxConfig::parse(&format!(
            "firmware=/tmp/TDVF.fd,sept_ve_disable=off,migtd_hash={hash},migtd_attr=0x1,vsockport=1234,quote_generation_service=vsock:2:4050"
        ))?;
        assert!(!tdx.sept_ve_disable);
        assert_eq!(tdx.migtd_hash.0, [0xab; TDX_MEASUREMENT_SIZE]);
        assert_eq!(tdx.migtd_attr, 1);
        assert_eq!(tdx.vsockport, Some(1234));
        assert_eq!(
            tdx.quote_generation_service,
            Some(QuoteEndpoint::Vsock { cid: 2, port: 4050 })
        );
        assert!(tdx.migtd_configured());

        assert!(matches!(
            TdxConfig::parse("firmware=/tmp/TDVF.fd,mrowner=abcd"),
            Err(Error::ParseTdxMeasurement(..))
        ));
        Ok(())
    }

    #[test]
    fn test_quote_endpoint() {
        assert_eq!(
            "unix:/run/qgs.sock".parse::<QuoteEndpoint>().unwrap(),
            QuoteEndpoint::Unix(PathBuf::from("/run/qgs.sock"))
        );
        assert_eq!(
            "inet:127.0.0.1:4050".parse::<QuoteEndpoint>().unwrap(),
            QuoteEndpoint::Inet("127.0.0.1:4050".parse().unwrap())
        );
        assert!("tcp:127.0.0.1:4050".parse::<QuoteEndpoint>().is_err());
        assert!("vsock:2".parse::<QuoteEndpoint>().is_err());
        assert!("unix:".parse::<QuoteEndpoint>().is_err());

        let endpoint = QuoteEndpoint::Vsock { cid: 2, port: 4050 };
        assert_eq!(endpoint.to_string().parse::<QuoteEndpoint>().unwrap(), endpoint);
    }

    #[test]
    fn test_config_serialization() {
        let mut tdx = TdxConfig::new(PathBuf::from("/tmp/TDVF.fd"));
        tdx.mrconfigid = Sha384([0x11; TDX_MEASUREMENT_SIZE]);
        let config = VmConfig {
            tdx: Some(tdx),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(&"11".repeat(TDX_MEASUREMENT_SIZE)));
        let back: VmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validation() {
        let firmware = TempFile::new().unwrap();
        let mut config = VmConfig {
            tdx: Some(TdxConfig::new(firmware.as_path().to_path_buf())),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.tsc_khz = Some(2_010_000);
        assert!(matches!(
            config.validate(),
            Err(ValidationError::TscFrequency(_))
        ));
        config.tsc_khz = Some(2_000_000);
        assert!(config.validate().is_ok());

        config.memory.size = 4095;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MemoryUnaligned(_))
        ));
        config.memory.size = 1 << 30;

        config.tdx = None;
        config.incoming = true;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::IncomingWithoutTdx)
        ));

        config.tdx = Some(TdxConfig::new(PathBuf::from("/does/not/exist")));
        assert!(matches!(
            config.validate(),
            Err(ValidationError::FirmwareMissing(_))
        ));
    }
}
