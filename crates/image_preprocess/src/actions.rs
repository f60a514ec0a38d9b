//! Named preprocessing actions and the per-mode programs built from them.
//!
//! Actions come from the `[dataset.preprocess]` config table. Each entry is
//! either a bare name (`"random_flip"`) or a table with a `type` key and the
//! action's parameters (`{ type = "central_crop", fraction = 0.9 }`). A mode
//! may list a single entry instead of an array.

use crate::aug::{ImagePreprocess, DEFAULT_CENTRAL_FRACTION};
use crate::tensor::ImageTensor;
use crate::types::{ImageShape, Mode, Moment, PreprocessError, PreprocessResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    DistortBbox,
    DistortColor,
    CentralCrop {
        #[serde(default = "default_fraction")]
        fraction: f32,
    },
    RandomCrop {
        #[serde(default)]
        height: Option<usize>,
        #[serde(default)]
        width: Option<usize>,
    },
    CropOrPad {
        #[serde(default)]
        height: Option<usize>,
        #[serde(default)]
        width: Option<usize>,
    },
    Resize {
        #[serde(default)]
        height: Option<usize>,
        #[serde(default)]
        width: Option<usize>,
        #[serde(default)]
        fill: bool,
    },
    RandomFlip,
    LinearMap {
        #[serde(default = "default_scale")]
        scale: f32,
        #[serde(default)]
        shift: f32,
    },
    SubtractChannelMeans,
    NormalizeChannels,
    SubtractImageMean,
    StandardizeImage,
    PermuteChannels {
        order: Vec<usize>,
    },
}

fn default_fraction() -> f32 {
    DEFAULT_CENTRAL_FRACTION
}

fn default_scale() -> f32 {
    1.0
}

impl Action {
    /// Looks up an action by name with every parameter defaulted.
    pub fn from_name(name: &str) -> PreprocessResult<Self> {
        let mut table = toml::Table::new();
        table.insert("type".to_string(), toml::Value::String(name.to_string()));
        toml::Value::Table(table)
            .try_into::<Action>()
            .map_err(|e| PreprocessError::Config(format!("action {name:?}: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::DistortBbox => "distort_bbox",
            Action::DistortColor => "distort_color",
            Action::CentralCrop { .. } => "central_crop",
            Action::RandomCrop { .. } => "random_crop",
            Action::CropOrPad { .. } => "crop_or_pad",
            Action::Resize { .. } => "resize",
            Action::RandomFlip => "random_flip",
            Action::LinearMap { .. } => "linear_map",
            Action::SubtractChannelMeans => "subtract_channel_means",
            Action::NormalizeChannels => "normalize_channels",
            Action::SubtractImageMean => "subtract_image_mean",
            Action::StandardizeImage => "standardize_image",
            Action::PermuteChannels { .. } => "permute_channels",
        }
    }

    /// Parameter checks that do not depend on the image being processed.
    pub fn validate(&self) -> PreprocessResult<()> {
        let bad = |msg: String| Err(PreprocessError::Config(format!("{}: {msg}", self.name())));
        match self {
            Action::CentralCrop { fraction } if !(*fraction > 0.0 && *fraction <= 1.0) => {
                bad(format!("fraction must be in (0, 1], got {fraction}"))
            }
            Action::RandomCrop { height, width }
            | Action::CropOrPad { height, width }
            | Action::Resize { height, width, .. }
                if *height == Some(0) || *width == Some(0) =>
            {
                bad("sizes must be positive".to_string())
            }
            Action::LinearMap { scale, shift } if !scale.is_finite() || !shift.is_finite() => {
                bad("scale and shift must be finite".to_string())
            }
            Action::PermuteChannels { order } if order.is_empty() => {
                bad("channel order must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn apply(
        &self,
        ip: &mut ImagePreprocess,
        image: ImageTensor,
    ) -> PreprocessResult<ImageTensor> {
        match self {
            Action::DistortBbox => ip.distort_bbox(image),
            Action::DistortColor => ip.distort_color(image),
            Action::CentralCrop { fraction } => ip.central_crop(image, *fraction),
            Action::RandomCrop { height, width } => ip.random_crop(image, *height, *width),
            Action::CropOrPad { height, width } => ip.crop_or_pad(image, *height, *width),
            Action::Resize {
                height,
                width,
                fill,
            } => ip.resize(image, *height, *width, *fill),
            Action::RandomFlip => ip.random_flip(image),
            Action::LinearMap { scale, shift } => ip.linear_map(image, *scale, *shift),
            Action::SubtractChannelMeans => ip.subtract_channel_means(image),
            Action::NormalizeChannels => ip.normalize_channels(image),
            Action::SubtractImageMean => ip.subtract_image_mean(image),
            Action::StandardizeImage => ip.standardize_image(image),
            Action::PermuteChannels { order } => ip.permute_channels(image, order),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionEntry {
    Named(String),
    Table(Action),
}

impl ActionEntry {
    pub fn resolve(&self) -> PreprocessResult<Action> {
        match self {
            ActionEntry::Named(name) => Action::from_name(name),
            ActionEntry::Table(action) => Ok(action.clone()),
        }
    }
}

/// One mode's action list; a single entry stands for a one-element list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionList {
    Many(Vec<ActionEntry>),
    One(ActionEntry),
}

impl ActionList {
    pub fn entries(&self) -> &[ActionEntry] {
        match self {
            ActionList::Many(entries) => entries,
            ActionList::One(entry) => std::slice::from_ref(entry),
        }
    }
}

impl From<Vec<Action>> for ActionList {
    fn from(actions: Vec<Action>) -> Self {
        ActionList::Many(actions.into_iter().map(ActionEntry::Table).collect())
    }
}

/// Action lists per mode plus the `final` list appended to both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessActions {
    #[serde(default)]
    pub train: Option<ActionList>,
    #[serde(default)]
    pub validate: Option<ActionList>,
    #[serde(default, rename = "final")]
    pub final_actions: Option<ActionList>,
}

impl PreprocessActions {
    /// Resolves and validates the program one lane runs in `mode`.
    pub fn program(&self, mode: Mode) -> PreprocessResult<Vec<Action>> {
        let mode_list = match mode {
            Mode::Train => &self.train,
            Mode::Validate => &self.validate,
        };
        let mut program = Vec::new();
        for list in [mode_list, &self.final_actions].into_iter().flatten() {
            for entry in list.entries() {
                let action = entry.resolve()?;
                action.validate()?;
                program.push(action);
            }
        }
        Ok(program)
    }
}

/// Logs, once per program, each moment statistic the program will default.
pub fn warn_missing_moments(program: &[Action], moment: Option<&Moment>, shape: &ImageShape) {
    let uses = |pred: fn(&Action) -> bool| program.iter().any(pred);
    let needs_mean = uses(|a| {
        matches!(
            a,
            Action::SubtractChannelMeans | Action::NormalizeChannels
        )
    });
    let needs_std = uses(|a| matches!(a, Action::NormalizeChannels));
    let has_mean = moment.is_some_and(|m| m.mean.is_some());
    let has_std = moment.is_some_and(|m| m.std.is_some());
    if needs_mean && !has_mean {
        warn!(
            channels = shape.channels,
            "no channel means configured; subtracting 0.5 from every channel"
        );
    }
    if needs_std && !has_std {
        warn!("no channel stds configured; normalize_channels only subtracts means");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        preprocess: PreprocessActions,
    }

    fn parse(src: &str) -> PreprocessActions {
        toml::from_str::<Wrapper>(src).unwrap().preprocess
    }

    #[test]
    fn scalar_entry_becomes_one_element_program() {
        let actions = parse(
            r#"
            [preprocess]
            train = "random_flip"
            "#,
        );
        assert_eq!(actions.program(Mode::Train).unwrap(), vec![Action::RandomFlip]);
        assert!(actions.program(Mode::Validate).unwrap().is_empty());
    }

    #[test]
    fn mixed_entries_with_final_list() {
        let actions = parse(
            r#"
            [preprocess]
            train = ["distort_bbox", { type = "linear_map", scale = 2.0 }]
            validate = { type = "central_crop" }
            final = ["subtract_image_mean"]
            "#,
        );
        assert_eq!(
            actions.program(Mode::Train).unwrap(),
            vec![
                Action::DistortBbox,
                Action::LinearMap {
                    scale: 2.0,
                    shift: 0.0
                },
                Action::SubtractImageMean,
            ]
        );
        assert_eq!(
            actions.program(Mode::Validate).unwrap(),
            vec![
                Action::CentralCrop { fraction: 0.875 },
                Action::SubtractImageMean
            ]
        );
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        let actions = parse(
            r#"
            [preprocess]
            train = ["random_rotate"]
            "#,
        );
        assert!(matches!(
            actions.program(Mode::Train),
            Err(PreprocessError::Config(_))
        ));
    }

    #[test]
    fn permute_needs_an_order() {
        assert!(Action::from_name("permute_channels").is_err());
        let action = Action::PermuteChannels { order: vec![] };
        assert!(action.validate().is_err());
    }

    #[test]
    fn invalid_parameters_fail_validation() {
        assert!(Action::CentralCrop { fraction: 1.5 }.validate().is_err());
        assert!(Action::Resize {
            height: Some(0),
            width: None,
            fill: false
        }
        .validate()
        .is_err());
        assert!(Action::CentralCrop { fraction: 1.0 }.validate().is_ok());
    }

    #[test]
    fn names_round_trip_through_registry() {
        for name in ["distort_bbox", "resize", "standardize_image", "crop_or_pad"] {
            assert_eq!(Action::from_name(name).unwrap().name(), name);
        }
    }
}
