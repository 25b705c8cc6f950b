//! Ontology labels: JSON roots <-> typed label tree, plus label creation helpers.

use serde_json::json;

use crate::{DloopError, DloopResult, EntityOrRaw, Json, JsonMap};

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub tag: String,
    pub display_label: String,
    pub color: String,
    pub attributes: Vec<Json>,
    pub children: Vec<Label>,
}

impl Label {
    pub fn from_root(root: &Json) -> DloopResult<Self> {
        let value = root.get("value").unwrap_or(root);
        let tag = value
            .get("tag")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DloopError::validation("label root missing value.tag"))?
            .to_string();
        let display_label = value
            .get("displayLabel")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| display_label_for(&tag));
        let color = value.get("color").and_then(color_from_json).unwrap_or_else(|| color_for(&tag));
        let attributes = value.get("attributes").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let children = match root.get("children").and_then(|v| v.as_array()) {
            Some(arr) => arr.iter().map(Label::from_root).collect::<DloopResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Label { tag, display_label, color, attributes, children })
    }

    pub fn to_root(&self) -> Json {
        json!({
            "value": {
                "tag": self.tag,
                "displayLabel": self.display_label,
                "color": self.color,
                "attributes": self.attributes,
            },
            "children": self.children.iter().map(Label::to_root).collect::<Vec<_>>(),
        })
    }
}

/// Parameters for a label that does not exist yet.
#[derive(Debug, Clone, Default)]
pub struct NewLabel {
    pub name: String,
    pub color: Option<String>,
    pub display_label: Option<String>,
    pub attributes: Vec<Json>,
    pub children: Vec<EntityOrRaw<Label>>,
}

impl NewLabel {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Accepts `{"value": {"tag": ..}, "children": [..]}` or a flat map keyed by
    /// `tag` / `label_name`.
    pub fn from_raw(raw: &Json) -> DloopResult<Self> {
        let children = raw
            .get("children")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().cloned().map(EntityOrRaw::Raw).collect())
            .unwrap_or_default();
        let value = raw.get("value").unwrap_or(raw);
        let name = value
            .get("tag")
            .or_else(|| value.get("label_name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| DloopError::validation("invalid input - each label must have a tag"))?
            .to_string();
        let color = value.get("color").and_then(color_from_json);
        let display_label = value
            .get("displayLabel")
            .or_else(|| value.get("display_label"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let attributes = match value.get("attributes") {
            Some(Json::Array(a)) => a.clone(),
            Some(Json::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        Ok(Self { name, color, display_label, attributes, children })
    }

    fn build(self) -> DloopResult<Label> {
        let children = self
            .children
            .into_iter()
            .map(|c| match c {
                EntityOrRaw::Typed(l) => Ok(l),
                EntityOrRaw::Raw(v) => NewLabel::from_raw(&v)?.build(),
            })
            .collect::<DloopResult<Vec<_>>>()?;
        let display_label = self.display_label.unwrap_or_else(|| display_label_for(&self.name));
        let color = self.color.unwrap_or_else(|| color_for(&self.name));
        Ok(Label { tag: self.name, display_label, color, attributes: self.attributes, children })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ontology {
    pub id: String,
    pub creator: Option<String>,
    pub url: Option<String>,
    pub metadata: JsonMap,
    pub attributes: Vec<Json>,
    pub labels: Vec<Label>,
}

impl Ontology {
    pub fn from_json(v: &Json) -> DloopResult<Self> {
        let id = v
            .get("id")
            .and_then(|x| x.as_str())
            .ok_or_else(|| DloopError::validation("ontology missing id"))?
            .to_string();
        let roots = v
            .get("roots")
            .and_then(|x| x.as_array())
            .ok_or_else(|| DloopError::validation("ontology missing roots"))?;
        let labels = roots.iter().map(Label::from_root).collect::<DloopResult<Vec<_>>>()?;
        Ok(Self {
            id,
            creator: v.get("creator").and_then(|x| x.as_str()).map(|s| s.to_string()),
            url: v.get("url").and_then(|x| x.as_str()).map(|s| s.to_string()),
            metadata: v.get("metadata").and_then(|x| x.as_object()).cloned().unwrap_or_default(),
            attributes: v.get("attributes").and_then(|x| x.as_array()).cloned().unwrap_or_default(),
            labels,
        })
    }

    pub fn to_json(&self) -> Json {
        json!({
            "id": self.id,
            "creator": self.creator,
            "url": self.url,
            "metadata": self.metadata,
            "attributes": self.attributes,
            "roots": self.labels.iter().map(Label::to_root).collect::<Vec<_>>(),
        })
    }

    /// Build a label (children included) and append it to the ontology.
    pub fn add_label(&mut self, new: NewLabel) -> DloopResult<Label> {
        let label = new.build()?;
        self.labels.push(label.clone());
        Ok(label)
    }

    /// Add several labels; raw inputs are validated before anything is appended.
    pub fn add_labels(&mut self, inputs: Vec<EntityOrRaw<Label>>) -> DloopResult<Vec<Label>> {
        let mut built = Vec::with_capacity(inputs.len());
        for input in inputs {
            let label = match input {
                EntityOrRaw::Typed(l) => l,
                EntityOrRaw::Raw(v) => NewLabel::from_raw(&v)?.build()?,
            };
            built.push(label);
        }
        self.labels.extend(built.iter().cloned());
        Ok(built)
    }
}

/// `dog` -> `Dog`, `big_red_dog` -> `Big Red Dog`.
pub fn display_label_for(tag: &str) -> String {
    tag.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable color for a tag (FNV-1a over the bytes).
pub fn color_for(tag: &str) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in tag.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    let [r, g, b, ..] = h.to_be_bytes();
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

fn color_from_json(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Array(parts) if parts.len() == 3 => {
            let mut rgb = [0u8; 3];
            for (slot, p) in rgb.iter_mut().zip(parts) {
                *slot = u8::try_from(p.as_u64()?).ok()?;
            }
            Some(format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Ontology {
        Ontology::from_json(&json!({"id": "o1", "roots": []})).unwrap()
    }

    #[test]
    fn display_labels_are_title_cased() {
        assert_eq!(display_label_for("dog"), "Dog");
        assert_eq!(display_label_for("big_red_dog"), "Big Red Dog");
        assert_eq!(display_label_for("a__b"), "A B");
    }

    #[test]
    fn colors_are_stable_hex() {
        let c = color_for("dog");
        assert_eq!(c, color_for("dog"));
        assert_eq!(c.len(), 7);
        assert!(c.starts_with('#'));
    }

    #[test]
    fn add_label_builds_children_from_raw() {
        let mut o = empty();
        let mut new = NewLabel::named("vehicle");
        new.children = vec![EntityOrRaw::Raw(json!({"label_name": "red_car", "color": [255, 0, 0]}))];
        let l = o.add_label(new).unwrap();
        assert_eq!(l.display_label, "Vehicle");
        assert_eq!(l.children.len(), 1);
        assert_eq!(l.children[0].display_label, "Red Car");
        assert_eq!(l.children[0].color, "#ff0000");
        assert_eq!(o.labels.len(), 1);
    }

    #[test]
    fn add_labels_rejects_tagless_input_without_partial_append() {
        let mut o = empty();
        let err = o
            .add_labels(vec![
                EntityOrRaw::Raw(json!({"value": {"tag": "ok"}})),
                EntityOrRaw::Raw(json!({"color": "#000000"})),
            ])
            .unwrap_err();
        assert!(matches!(err, DloopError::Validation(_)));
        assert!(o.labels.is_empty());
    }

    #[test]
    fn roots_roundtrip_through_json() {
        let src = json!({
            "id": "o1",
            "creator": "me@x",
            "roots": [{"value": {"tag": "cat", "displayLabel": "Kitty", "color": "#123456", "attributes": ["a"]},
                       "children": [{"value": {"tag": "kitten"}, "children": []}]}]
        });
        let o = Ontology::from_json(&src).unwrap();
        assert_eq!(o.labels[0].display_label, "Kitty");
        assert_eq!(o.labels[0].children[0].display_label, "Kitten");
        let back = Ontology::from_json(&o.to_json()).unwrap();
        assert_eq!(back, o);
    }
}
