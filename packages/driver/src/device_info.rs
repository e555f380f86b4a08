//! The device-info catalog: per-model XML files that tell the runtime what
//! a given manufacturer id supports, which command classes are secure,
//! free-form extra info for the CC implementations, and the auto-config
//! actions to apply when a unit is first bound.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zwusb_core::definitions::{ManufacturerId, NodeId};

/// One free-form `Name=Value` pair, optionally scoped to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XInfoItem {
    pub name: String,
    pub value: String,
    pub endpoint: Option<u8>,
}

/// A command class the model supports.
#[derive(Debug, Clone, PartialEq)]
pub struct CcInfo {
    pub class: u8,
    pub version: u8,
    pub secure: bool,
    pub extra_info: Vec<XInfoItem>,
}

/// One association group membership to establish at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct AssocGroup {
    pub group: u8,
    pub dest: NodeId,
    pub endpoint: Option<u8>,
}

/// One configuration parameter to set at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgParam {
    pub number: u8,
    pub value: i64,
    pub size: u8,
    pub desc: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoCfg {
    pub wakeup_interval: Option<u32>,
    pub groups: Vec<AssocGroup>,
    pub params: Vec<CfgParam>,
}

/// Everything one per-model file declares.
#[derive(Debug, Clone, PartialEq)]
pub struct DevInfo {
    pub name: String,
    pub manufacturer_id: ManufacturerId,
    /// Selects the composite unit pattern (BinNotSensor, GenDimmer, ...).
    pub unit_class: String,
    pub ccs: Vec<CcInfo>,
    pub extra_info: Vec<XInfoItem>,
    pub auto_cfg: AutoCfg,
}

impl DevInfo {
    pub fn parse_xml(text: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| Error::DeviceInfo(format!("bad XML: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "Dev" {
            return Err(Error::DeviceInfo("root element must be Dev".into()));
        }

        let man_ids = attr(&root, "ManIds")?;
        let manufacturer_id = ManufacturerId::from_packed(
            parse_num(man_ids).ok_or_else(|| Error::DeviceInfo("bad ManIds".into()))? as u64,
        );

        let mut info = DevInfo {
            name: root.attribute("Name").unwrap_or_default().to_string(),
            manufacturer_id,
            unit_class: attr(&root, "UnitClass")?.to_string(),
            ccs: Vec::new(),
            extra_info: Vec::new(),
            auto_cfg: AutoCfg::default(),
        };

        for child in root.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "CCs" => {
                    for cc in child.children().filter(|n| n.is_element()) {
                        info.ccs.push(parse_cc(&cc)?);
                    }
                }
                "ExtraInfo" => info.extra_info.push(parse_xinfo(&child)?),
                "AutoCfg" => info.auto_cfg = parse_auto_cfg(&child)?,
                other => {
                    return Err(Error::DeviceInfo(format!("unknown element {other}")));
                }
            }
        }

        Ok(info)
    }

    pub fn cc(&self, class: u8) -> Option<&CcInfo> {
        self.ccs.iter().find(|c| c.class == class)
    }

    pub fn supports(&self, class: u8) -> bool {
        self.cc(class).is_some()
    }

    /// Whether the unit expects this class under S0 encapsulation.
    pub fn secure_class(&self, class: u8) -> bool {
        self.cc(class).map(|c| c.secure).unwrap_or(false)
    }

    /// Extra info attached to one class, root scope plus the requested
    /// endpoint's entries.
    pub fn cc_extra_info(&self, class: u8, endpoint: Option<u8>) -> Vec<XInfoItem> {
        let Some(cc) = self.cc(class) else {
            return Vec::new();
        };
        cc.extra_info
            .iter()
            .filter(|x| x.endpoint.is_none() || x.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// Look up a unit-level extra info value.
    pub fn unit_extra_info(&self, name: &str) -> Option<&str> {
        self.extra_info
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.as_str())
    }
}

fn attr<'a>(node: &'a roxmltree::Node, name: &str) -> Result<&'a str> {
    node.attribute(name)
        .ok_or_else(|| Error::DeviceInfo(format!("missing attribute {name}")))
}

/// Parse "123" or "0x7B".
pub fn parse_num(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_cc(node: &roxmltree::Node) -> Result<CcInfo> {
    if node.tag_name().name() != "CC" {
        return Err(Error::DeviceInfo(format!(
            "unexpected element {} in CCs",
            node.tag_name().name()
        )));
    }
    let class = parse_num(attr(node, "N")?)
        .filter(|v| (0..=0xff).contains(v))
        .ok_or_else(|| Error::DeviceInfo("bad CC number".into()))? as u8;
    let version = node
        .attribute("V")
        .and_then(parse_num)
        .unwrap_or(1) as u8;
    let secure = node
        .attribute("Sec")
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut extra_info = Vec::new();
    for child in node.children().filter(|n| n.is_element()) {
        extra_info.push(parse_xinfo(&child)?);
    }

    Ok(CcInfo {
        class,
        version,
        secure,
        extra_info,
    })
}

fn parse_xinfo(node: &roxmltree::Node) -> Result<XInfoItem> {
    if node.tag_name().name() != "ExtraInfo" {
        return Err(Error::DeviceInfo(format!(
            "unexpected element {}",
            node.tag_name().name()
        )));
    }
    let endpoint = match node.attribute("EndPnt") {
        Some(text) => Some(
            parse_num(text)
                .filter(|v| (0..=127).contains(v))
                .ok_or_else(|| Error::DeviceInfo("bad EndPnt".into()))? as u8,
        ),
        None => None,
    };
    Ok(XInfoItem {
        name: attr(node, "Name")?.to_string(),
        value: attr(node, "Value")?.to_string(),
        endpoint,
    })
}

fn parse_auto_cfg(node: &roxmltree::Node) -> Result<AutoCfg> {
    let mut cfg = AutoCfg {
        wakeup_interval: node
            .attribute("WI")
            .and_then(parse_num)
            .map(|v| v as u32),
        ..Default::default()
    };

    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "Grp" => {
                let group = parse_num(attr(&child, "N")?)
                    .ok_or_else(|| Error::DeviceInfo("bad Grp number".into()))?
                    as u8;
                let dest = child
                    .attribute("D")
                    .and_then(parse_num)
                    .map(|v| NodeId::new(v as u8))
                    .unwrap_or_else(NodeId::unspecified);
                let endpoint = child
                    .attribute("EP")
                    .and_then(parse_num)
                    .map(|v| v as u8);
                cfg.groups.push(AssocGroup {
                    group,
                    dest,
                    endpoint,
                });
            }
            "CfgParm" => {
                cfg.params.push(CfgParam {
                    number: parse_num(attr(&child, "N")?)
                        .ok_or_else(|| Error::DeviceInfo("bad CfgParm number".into()))?
                        as u8,
                    value: parse_num(attr(&child, "V")?)
                        .ok_or_else(|| Error::DeviceInfo("bad CfgParm value".into()))?,
                    size: parse_num(attr(&child, "C")?)
                        .filter(|v| matches!(v, 1 | 2 | 4))
                        .ok_or_else(|| Error::DeviceInfo("bad CfgParm size".into()))?
                        as u8,
                    desc: child.attribute("D").unwrap_or_default().to_string(),
                });
            }
            other => {
                return Err(Error::DeviceInfo(format!(
                    "unknown element {other} in AutoCfg"
                )));
            }
        }
    }

    Ok(cfg)
}

/// The on-disk catalog: a directory of per-model XML files, indexed by the
/// manufacturer id each file declares.
pub struct DevInfoCatalog {
    index: BTreeMap<u64, PathBuf>,
}

impl DevInfoCatalog {
    /// Scan a directory tree for device info files and index them by their
    /// packed manufacturer id. Files that fail to parse are skipped; an
    /// unreadable catalog is worth a degraded driver, not a dead one.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut index = BTreeMap::new();
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            if let Ok(info) = DevInfo::parse_xml(&text) {
                index.insert(info.manufacturer_id.packed(), path.to_path_buf());
            }
        }
        Ok(Self { index })
    }

    /// An empty catalog, for setups that bind units programmatically.
    pub fn empty() -> Self {
        Self {
            index: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn lookup(&self, id: ManufacturerId) -> Result<DevInfo> {
        let path = self
            .index
            .get(&id.packed())
            .ok_or_else(|| Error::DeviceInfo(format!("no device info for {id}")))?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::DeviceInfo(format!("cannot read {}: {e}", path.display())))?;
        DevInfo::parse_xml(&text)
    }
}
