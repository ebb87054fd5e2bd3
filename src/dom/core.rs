use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blake3::Hash;

use crate::error::{BlockError, Result};
use crate::geometry::{Rect, Size};

use super::fragment::{Fragment, HiddenField, parse_class_list, strip_markup};

pub type RegionId = String;

/// Document shared between the host and every mounted block.
pub type SharedDocument = Arc<RwLock<Document>>;

pub fn shared(document: Document) -> SharedDocument {
    Arc::new(RwLock::new(document))
}

pub fn read(document: &SharedDocument) -> Result<RwLockReadGuard<'_, Document>> {
    document.read().map_err(|_| BlockError::Poisoned)
}

pub fn write(document: &SharedDocument) -> Result<RwLockWriteGuard<'_, Document>> {
    document.write().map_err(|_| BlockError::Poisoned)
}

/// A node of the host page: an element with BEM marks, a hide flag and content.
#[derive(Debug, Clone)]
pub struct Region {
    id: RegionId,
    parent: Option<RegionId>,
    children: Vec<RegionId>,
    marks: Vec<String>,
    modifiers: BTreeMap<String, String>,
    hidden: bool,
    content: String,
    hash: Option<Hash>,
    rect: Rect,
    fields: Vec<HiddenField>,
    declaration: Option<String>,
    is_dirty: bool,
}

impl Region {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[RegionId] {
        &self.children
    }

    pub fn marks(&self) -> &[String] {
        &self.marks
    }

    pub fn has_mark(&self, mark: &str) -> bool {
        self.marks.iter().any(|m| m == mark)
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Content with markup removed.
    pub fn text(&self) -> String {
        strip_markup(&self.content)
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn fields(&self) -> &[HiddenField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value.as_str())
    }

    pub fn modifier(&self, key: &str) -> Option<&str> {
        self.modifiers.get(key).map(String::as_str)
    }

    pub fn modifiers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modifiers.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn declaration(&self) -> Option<&str> {
        self.declaration.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    fn update_content(&mut self, content: String) -> bool {
        let new_hash = blake3::hash(content.as_bytes());
        if self.hash.map(|h| h != new_hash).unwrap_or(true) {
            self.content = content;
            self.hash = Some(new_hash);
            self.is_dirty = true;
            return true;
        }
        false
    }
}

/// Builder describing a region before it is appended to a [`Document`].
#[derive(Debug, Clone, Default)]
pub struct RegionSpec {
    id: RegionId,
    marks: Vec<String>,
    modifiers: BTreeMap<String, String>,
    hidden: bool,
    content: String,
    rect: Rect,
    fields: Vec<HiddenField>,
    declaration: Option<String>,
}

impl RegionSpec {
    pub fn new(id: impl Into<RegionId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn mark(mut self, mark: impl Into<String>) -> Self {
        let mark = mark.into();
        if !self.marks.contains(&mark) {
            self.marks.push(mark);
        }
        self
    }

    /// Apply a BEM class list, e.g. `"paste__delete paste__delete_hide"`.
    pub fn classes(mut self, classes: &str) -> Self {
        let bem = parse_class_list(classes);
        for mark in bem.marks {
            self = self.mark(mark);
        }
        self.hidden |= bem.hidden;
        self.modifiers.extend(bem.modifiers);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn modifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.modifiers.insert(key.into(), value.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn rect(mut self, rect: Rect) -> Self {
        self.rect = rect;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(HiddenField::new(name, value));
        self
    }

    /// Attach a block declaration payload (`{"paste": {...}}`).
    pub fn declare(mut self, declaration: impl Into<String>) -> Self {
        self.declaration = Some(declaration.into());
        self
    }

    fn build(self, parent: Option<RegionId>) -> Region {
        let mut region = Region {
            id: self.id,
            parent,
            children: Vec::new(),
            marks: self.marks,
            modifiers: self.modifiers,
            hidden: self.hidden,
            content: String::new(),
            hash: None,
            rect: self.rect,
            fields: self.fields,
            declaration: self.declaration,
            is_dirty: true,
        };
        region.update_content(self.content);
        region
    }
}

/// In-memory page model: a region tree plus page-level state (viewport, body
/// scroll lock, user-visible notices).
#[derive(Debug, Default)]
pub struct Document {
    regions: HashMap<RegionId, Region>,
    roots: Vec<RegionId>,
    dirty: HashSet<RegionId>,
    viewport: Size,
    scroll_locks: BTreeSet<String>,
    notices: Vec<String>,
    fragment_seq: u64,
}

impl Document {
    pub fn new(viewport: Size) -> Self {
        Self {
            viewport,
            ..Self::default()
        }
    }

    /// Append a region as the last child of `parent`, or as a new root.
    pub fn append(&mut self, parent: Option<&str>, spec: RegionSpec) -> Result<()> {
        if self.regions.contains_key(&spec.id) {
            return Err(BlockError::DuplicateRegion(spec.id));
        }
        let id = spec.id.clone();
        match parent {
            Some(parent_id) => {
                let parent = self
                    .regions
                    .get_mut(parent_id)
                    .ok_or_else(|| BlockError::RegionNotFound(parent_id.to_string()))?;
                parent.children.push(id.clone());
            }
            None => self.roots.push(id.clone()),
        }
        self.regions
            .insert(id.clone(), spec.build(parent.map(str::to_string)));
        self.dirty.insert(id);
        Ok(())
    }

    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.regions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Present and not carrying the hide flag.
    pub fn is_visible(&self, id: &str) -> bool {
        self.regions.get(id).is_some_and(|r| !r.hidden)
    }

    /// Returns whether the flag changed.
    pub fn set_hidden(&mut self, id: &str, hidden: bool) -> Result<bool> {
        let region = self.region_mut(id)?;
        if region.hidden == hidden {
            return Ok(false);
        }
        region.hidden = hidden;
        region.is_dirty = true;
        self.dirty.insert(id.to_string());
        Ok(true)
    }

    pub fn modifier(&self, id: &str, key: &str) -> Option<&str> {
        self.regions.get(id).and_then(|r| r.modifier(key))
    }

    /// Set (`Some`) or clear (`None`) a key/value modifier. Returns whether it changed.
    pub fn set_modifier(&mut self, id: &str, key: &str, value: Option<&str>) -> Result<bool> {
        let region = self.region_mut(id)?;
        let changed = match value {
            Some(value) => {
                let previous = region.modifiers.insert(key.to_string(), value.to_string());
                previous.as_deref() != Some(value)
            }
            None => region.modifiers.remove(key).is_some(),
        };
        if changed {
            region.is_dirty = true;
            self.dirty.insert(id.to_string());
        }
        Ok(changed)
    }

    pub fn content(&self, id: &str) -> Option<&str> {
        self.regions.get(id).map(Region::content)
    }

    pub fn set_content(&mut self, id: &str, content: impl Into<String>) -> Result<bool> {
        let region = self.region_mut(id)?;
        let changed = region.update_content(content.into());
        if changed {
            self.dirty.insert(id.to_string());
        }
        Ok(changed)
    }

    /// Descendants of `scope` in document order, `scope` excluded.
    pub fn descendants(&self, scope: &str) -> Vec<RegionId> {
        let mut out = Vec::new();
        if let Some(region) = self.regions.get(scope) {
            let mut stack: Vec<&RegionId> = region.children.iter().rev().collect();
            while let Some(id) = stack.pop() {
                out.push(id.clone());
                if let Some(child) = self.regions.get(id) {
                    stack.extend(child.children.iter().rev());
                }
            }
        }
        out
    }

    /// Every descendant of `scope` carrying `mark`, in document order.
    pub fn find_marked(&self, scope: &str, mark: &str) -> Vec<RegionId> {
        self.descendants(scope)
            .into_iter()
            .filter(|id| self.regions.get(id).is_some_and(|r| r.has_mark(mark)))
            .collect()
    }

    pub fn first_marked(&self, scope: &str, mark: &str) -> Option<RegionId> {
        self.find_marked(scope, mark).into_iter().next()
    }

    /// True when `id` is `ancestor` or lies beneath it.
    pub fn is_within(&self, id: &str, ancestor: &str) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.regions.get(current).and_then(Region::parent);
        }
        false
    }

    /// First hidden field named `name` in `scope` or beneath it.
    pub fn field_value(&self, scope: &str, name: &str) -> Option<String> {
        std::iter::once(scope.to_string())
            .chain(self.descendants(scope))
            .find_map(|id| {
                self.regions
                    .get(&id)
                    .and_then(|r| r.field(name))
                    .map(str::to_string)
            })
    }

    /// Swap the region for `fragment`.
    ///
    /// The region keeps its id and position but loses its marks, modifiers,
    /// fields and children. Marked elements inside the fragment become new
    /// child regions, so a fragment can carry the next insertion point.
    pub fn replace_with_fragment(
        &mut self,
        id: &str,
        fragment: &Fragment,
    ) -> Result<Vec<RegionId>> {
        let old_children = self.region_mut(id)?.children.clone();
        for child in old_children {
            self.remove(&child)?;
        }

        let scan = fragment.scan();
        {
            let region = self.region_mut(id)?;
            region.marks.clear();
            region.modifiers.clear();
            region.fields = scan.loose_fields.clone();
            region.hidden = false;
            region.is_dirty = true;
            region.update_content(fragment.as_str().to_string());
        }
        self.dirty.insert(id.to_string());

        let mut created: Vec<RegionId> = Vec::with_capacity(scan.elements.len());
        for element in scan.elements {
            self.fragment_seq += 1;
            let child_id = format!("{id}/{}", self.fragment_seq);
            let parent = element
                .parent
                .and_then(|idx| created.get(idx).cloned())
                .unwrap_or_else(|| id.to_string());
            let mut spec = RegionSpec::new(child_id.clone()).hidden(element.classes.hidden);
            for mark in element.classes.marks {
                spec = spec.mark(mark);
            }
            for (key, value) in element.classes.modifiers {
                spec = spec.modifier(key, value);
            }
            for field in element.fields {
                spec = spec.field(field.name, field.value);
            }
            self.append(Some(parent.as_str()), spec)?;
            created.push(child_id);
        }
        Ok(created)
    }

    /// Remove `id` and its sub-tree. Returns every removed id.
    pub fn remove(&mut self, id: &str) -> Result<Vec<RegionId>> {
        if !self.regions.contains_key(id) {
            return Err(BlockError::RegionNotFound(id.to_string()));
        }
        let mut removed = vec![id.to_string()];
        removed.extend(self.descendants(id));

        let parent = self.regions.get(id).and_then(|r| r.parent.clone());
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.regions.get_mut(&parent_id) {
                    parent.children.retain(|child| child != id);
                    parent.is_dirty = true;
                    self.dirty.insert(parent_id);
                }
            }
            None => self.roots.retain(|root| root != id),
        }
        for gone in &removed {
            self.regions.remove(gone);
            self.dirty.remove(gone);
        }
        Ok(removed)
    }

    pub fn rect_of(&self, id: &str) -> Option<Rect> {
        self.regions.get(id).map(Region::rect)
    }

    pub fn set_height(&mut self, id: &str, height: u16) -> Result<()> {
        let region = self.region_mut(id)?;
        if region.rect.height != height {
            region.rect = region.rect.with_height(height);
            region.is_dirty = true;
            self.dirty.insert(id.to_string());
        }
        Ok(())
    }

    /// Apply rectangles measured by the host layout. Unknown ids are ignored.
    pub fn sync_layout(&mut self, solved_rects: &HashMap<RegionId, Rect>) {
        for (id, rect) in solved_rects {
            if let Some(region) = self.regions.get_mut(id) {
                if region.rect != *rect {
                    region.rect = *rect;
                    region.is_dirty = true;
                    self.dirty.insert(id.clone());
                }
            }
        }
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    pub fn set_viewport(&mut self, size: Size) {
        self.viewport = size;
    }

    /// Lock body scrolling on behalf of `owner`.
    pub fn lock_scroll(&mut self, owner: &str) {
        self.scroll_locks.insert(owner.to_string());
    }

    /// Release `owner`'s lock; scrolling resumes once no owner holds one.
    pub fn unlock_scroll(&mut self, owner: &str) {
        self.scroll_locks.remove(owner);
    }

    pub fn is_scroll_locked(&self) -> bool {
        !self.scroll_locks.is_empty()
    }

    /// Queue a message for the user (the browser host shows an alert).
    pub fn push_notice(&mut self, notice: impl Into<String>) {
        self.notices.push(notice.into());
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// Regions carrying a block declaration, in document order.
    pub fn declarations(&self) -> Vec<(RegionId, String)> {
        let mut out = Vec::new();
        for root in &self.roots {
            for id in std::iter::once(root.clone()).chain(self.descendants(root)) {
                if let Some(decl) = self.regions.get(&id).and_then(Region::declaration) {
                    out.push((id, decl.to_string()));
                }
            }
        }
        out
    }

    pub fn take_dirty(&mut self) -> Vec<RegionId> {
        let mut ids: Vec<_> = self.dirty.drain().collect();
        ids.sort();
        for id in &ids {
            if let Some(region) = self.regions.get_mut(id) {
                region.is_dirty = false;
            }
        }
        ids
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn region_mut(&mut self, id: &str) -> Result<&mut Region> {
        self.regions
            .get_mut(id)
            .ok_or_else(|| BlockError::RegionNotFound(id.to_string()))
    }
}
