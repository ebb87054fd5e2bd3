use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::dom::Document;
use crate::error::{BlockError, Result};

/// Visibility of the three sub-regions a display mode controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDescriptor {
    #[serde(alias = "trubber")]
    pub indicator: bool,
    #[serde(alias = "other")]
    pub affordance: bool,
    #[serde(alias = "delete", alias = "replace")]
    pub slot: bool,
}

impl ModeDescriptor {
    pub const fn new(indicator: bool, affordance: bool, slot: bool) -> Self {
        Self {
            indicator,
            affordance,
            slot,
        }
    }
}

pub const MODE_INIT: &str = "init";
pub const MODE_WAIT: &str = "wait";
pub const MODE_INSERT: &str = "insert";
pub const MODE_RESET: &str = "reset";

/// Named display modes available to one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTable {
    modes: BTreeMap<String, ModeDescriptor>,
}

impl ModeTable {
    /// The four lifecycle modes shared by every content block.
    pub fn base() -> Self {
        let mut modes = BTreeMap::new();
        modes.insert(MODE_INIT.to_string(), ModeDescriptor::new(false, true, false));
        modes.insert(MODE_WAIT.to_string(), ModeDescriptor::new(true, false, false));
        modes.insert(MODE_INSERT.to_string(), ModeDescriptor::new(false, false, true));
        modes.insert(MODE_RESET.to_string(), ModeDescriptor::new(false, false, false));
        Self { modes }
    }

    /// Base modes plus the combined ones used by Ajax blocks.
    pub fn extended() -> Self {
        let mut table = Self::base();
        for (name, descriptor) in [
            ("twoup", ModeDescriptor::new(true, true, false)),
            ("twodown", ModeDescriptor::new(false, true, true)),
            ("twocenter", ModeDescriptor::new(true, false, true)),
            ("all", ModeDescriptor::new(true, true, true)),
        ] {
            table.modes.insert(name.to_string(), descriptor);
        }
        table
    }

    /// Replace or add modes. Overrides come fully specified from a declaration.
    pub fn with_overrides(mut self, overrides: &HashMap<String, ModeDescriptor>) -> Self {
        for (name, descriptor) in overrides {
            self.modes.insert(name.clone(), *descriptor);
        }
        self
    }

    pub fn descriptor(&self, mode: &str) -> Result<ModeDescriptor> {
        self.modes
            .get(mode)
            .copied()
            .ok_or_else(|| BlockError::UnknownMode(mode.to_string()))
    }

    pub fn contains(&self, mode: &str) -> bool {
        self.modes.contains_key(mode)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modes.keys().map(String::as_str)
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::base()
    }
}

/// BEM marks of the indicator, affordance and slot regions of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMarks {
    pub indicator: String,
    pub affordance: String,
    pub slot: String,
}

impl RegionMarks {
    pub fn new(block: &str, indicator: &str, affordance: &str, slot: &str) -> Self {
        Self {
            indicator: format!("{block}__{indicator}"),
            affordance: format!("{block}__{affordance}"),
            slot: format!("{block}__{slot}"),
        }
    }

    /// `<block>__trubber`, `<block>__other` and `<block>__<slot>`.
    pub fn standard(block: &str, slot: &str) -> Self {
        Self::new(block, "trubber", "other", slot)
    }
}

/// Maps a mode name onto region visibility inside one block root.
#[derive(Debug, Clone)]
pub struct DisplayController {
    marks: RegionMarks,
    table: ModeTable,
    current: Option<String>,
}

impl DisplayController {
    pub fn new(marks: RegionMarks, table: ModeTable) -> Self {
        Self {
            marks,
            table,
            current: None,
        }
    }

    pub fn marks(&self) -> &RegionMarks {
        &self.marks
    }

    pub fn table(&self) -> &ModeTable {
        &self.table
    }

    /// Last mode applied successfully.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Go back to an earlier mode name after its visibility was restored by
    /// other means.
    pub fn restore(&mut self, mode: Option<String>) {
        self.current = mode;
    }

    /// Show or hide the first indicator, the first affordance and every slot
    /// under `root`. Absent indicator or affordance regions are skipped.
    pub fn apply(&mut self, doc: &mut Document, root: &str, mode: &str) -> Result<()> {
        let descriptor = self.table.descriptor(mode)?;
        if let Some(indicator) = doc.first_marked(root, &self.marks.indicator) {
            doc.set_hidden(&indicator, !descriptor.indicator)?;
        }
        if let Some(affordance) = doc.first_marked(root, &self.marks.affordance) {
            doc.set_hidden(&affordance, !descriptor.affordance)?;
        }
        for slot in doc.find_marked(root, &self.marks.slot) {
            doc.set_hidden(&slot, !descriptor.slot)?;
        }
        self.current = Some(mode.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::RegionSpec;
    use crate::geometry::Size;

    fn doc() -> Document {
        let mut doc = Document::new(Size::new(800, 600));
        doc.append(None, RegionSpec::new("root")).unwrap();
        doc.append(Some("root"), RegionSpec::new("t").mark("paste__trubber")).unwrap();
        doc.append(Some("root"), RegionSpec::new("o").mark("paste__other")).unwrap();
        doc.append(Some("root"), RegionSpec::new("d1").mark("paste__delete")).unwrap();
        doc.append(Some("root"), RegionSpec::new("d2").mark("paste__delete")).unwrap();
        doc
    }

    fn visibility(doc: &Document) -> [bool; 4] {
        ["t", "o", "d1", "d2"].map(|id| doc.is_visible(id))
    }

    #[test]
    fn base_modes_map_onto_regions() {
        let mut doc = doc();
        let mut ctl =
            DisplayController::new(RegionMarks::standard("paste", "delete"), ModeTable::base());

        ctl.apply(&mut doc, "root", "wait").unwrap();
        assert_eq!(visibility(&doc), [true, false, false, false]);
        ctl.apply(&mut doc, "root", "insert").unwrap();
        assert_eq!(visibility(&doc), [false, false, true, true]);
        ctl.apply(&mut doc, "root", "init").unwrap();
        assert_eq!(visibility(&doc), [false, true, false, false]);
        ctl.apply(&mut doc, "root", "reset").unwrap();
        assert_eq!(visibility(&doc), [false, false, false, false]);
        assert_eq!(ctl.current(), Some("reset"));
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let mut doc = doc();
        let mut ctl =
            DisplayController::new(RegionMarks::standard("paste", "delete"), ModeTable::base());
        ctl.apply(&mut doc, "root", "wait").unwrap();
        doc.take_dirty();
        ctl.apply(&mut doc, "root", "wait").unwrap();
        assert!(!doc.has_dirty());
    }

    #[test]
    fn unknown_mode_is_a_configuration_error() {
        let mut doc = doc();
        let mut ctl =
            DisplayController::new(RegionMarks::standard("paste", "delete"), ModeTable::base());
        let err = ctl.apply(&mut doc, "root", "twoup").unwrap_err();
        assert!(matches!(err, BlockError::UnknownMode(mode) if mode == "twoup"));
        assert_eq!(ctl.current(), None);
    }

    #[test]
    fn missing_indicator_is_skipped() {
        let mut doc = doc();
        doc.remove("t").unwrap();
        let mut ctl =
            DisplayController::new(RegionMarks::standard("paste", "delete"), ModeTable::base());
        ctl.apply(&mut doc, "root", "wait").unwrap();
        assert!(!doc.is_visible("o"));
    }

    #[test]
    fn overrides_deserialize_with_element_aliases() {
        let overrides: HashMap<String, ModeDescriptor> = serde_json::from_str(
            r#"{"wait": {"trubber": true, "other": true, "replace": false}}"#,
        )
        .unwrap();
        let table = ModeTable::extended().with_overrides(&overrides);
        assert_eq!(table.descriptor("wait").unwrap(), ModeDescriptor::new(true, true, false));
        assert_eq!(table.descriptor("all").unwrap(), ModeDescriptor::new(true, true, true));

        let partial = serde_json::from_str::<ModeDescriptor>(r#"{"trubber": true}"#);
        assert!(partial.is_err());
    }
}
