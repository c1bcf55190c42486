use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub const DEFAULT_STYLE: &str = "storybook_cartoon";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub denoising: f32,
    pub cfg_scale: f32,
    pub inference_steps: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            denoising: 0.45,
            cfg_scale: 6.8,
            inference_steps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PipelineMode {
    SingleStep,
    /// Stage one stylizes, stage two re-renders stage one's output with
    /// `refine_prompt`.
    TwoStep { refine_prompt: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StylePreset {
    pub key: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub face_fix: bool,
    pub mode: PipelineMode,
    pub settings: GenerationSettings,
    /// Shelved presets stay resolvable but are not offered to customers.
    pub shelved: bool,
}

impl StylePreset {
    pub fn single_step(key: &str, prompt: &str, negative_prompt: &str) -> Self {
        Self {
            key: key.to_string(),
            prompt: prompt.to_string(),
            negative_prompt: Some(negative_prompt.to_string()),
            face_fix: true,
            mode: PipelineMode::SingleStep,
            settings: GenerationSettings::default(),
            shelved: false,
        }
    }

    pub fn without_face_fix(mut self) -> Self {
        self.face_fix = false;
        self
    }

    pub fn two_step(mut self, refine_prompt: &str) -> Self {
        self.mode = PipelineMode::TwoStep {
            refine_prompt: refine_prompt.to_string(),
        };
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    fn shelved(mut self) -> Self {
        self.shelved = true;
        self
    }

    pub fn is_two_step(&self) -> bool {
        matches!(self.mode, PipelineMode::TwoStep { .. })
    }
}

const KEEP_LIKENESS: &str = "Keep the person's face, hair, and expression exactly as they are.";
const HAIR_NEGATIVES: &str = "wrong hair color, changed hairstyle, altered hair texture";

/// Read-only style lookup, built once at startup.
#[derive(Debug, Clone)]
pub struct StyleCatalog {
    presets: IndexMap<String, StylePreset>,
}

impl StyleCatalog {
    pub fn new(presets: impl IntoIterator<Item = StylePreset>) -> Self {
        Self {
            presets: presets
                .into_iter()
                .map(|preset| (preset.key.to_lowercase(), preset))
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new([
            StylePreset::single_step(
                "storybook_cartoon",
                &format!(
                    "Transform this photo into a Pixar-like cartoon illustration. Give the person \
                     exaggerated expressive eyes, soft shading, and a playful costume. Place them in \
                     a colorful whimsical village with floating lanterns, detailed props, and layered \
                     depth. Use a warm storybook illustration style. {}",
                    KEEP_LIKENESS
                ),
                &format!(
                    "hyper-realistic, uncanny valley, stiff pose, washed colors, facial distortion, {}",
                    HAIR_NEGATIVES
                ),
            ),
            StylePreset::single_step(
                "space_explorer",
                &format!(
                    "Transform this photo into a Pixar-like cartoon illustration. Dress the person in \
                     a colorful cartoon astronaut suit with a clear helmet visor showing their face. \
                     Place them floating in a bright, whimsical outer space scene with colorful \
                     planets, a rocket ship, friendly cartoon aliens, glowing nebulas, and twinkling \
                     stars. Use vibrant colors, soft cartoon shading, and a sense of playful wonder. {}",
                    KEEP_LIKENESS
                ),
                &format!(
                    "hyper-realistic, dark sci-fi, horror, grim atmosphere, stiff pose, washed colors, \
                     facial distortion, {}",
                    HAIR_NEGATIVES
                ),
            ),
            StylePreset::single_step(
                "underwater_adventure",
                &format!(
                    "Transform this photo into a Pixar-like cartoon illustration. Dress the person in \
                     a playful cartoon diving suit or mermaid costume. Place them in a vibrant \
                     underwater scene with colorful coral reefs, friendly sea creatures, a sunken \
                     treasure chest, flowing kelp, and shimmering bubbles. Use warm turquoise tones \
                     with golden light rays, soft cartoon shading, and rich layered depth. {}",
                    KEEP_LIKENESS
                ),
                &format!(
                    "hyper-realistic, dark ocean, murky water, horror, stiff pose, washed colors, \
                     facial distortion, {}",
                    HAIR_NEGATIVES
                ),
            ),
            // Photographic identity fix on pixel art looks wrong.
            StylePreset::single_step(
                "pixel_platformer",
                "Transform this photo into vibrant pixel art in the style of a classic \
                 side-scrolling platformer game. Make the person a cute pixel art character with a \
                 recognizable pixelated version of their face and hair. Place them in a colorful \
                 platformer level with pixel platforms, fluffy clouds, collectible coins and stars, \
                 and colorful blocks against a bright blue sky. Use clean pixel art shading with bold \
                 primary colors. Keep the person's face, hair, and expression recognizable in pixel form.",
                "photorealistic, blurry, painterly, dark atmosphere, horror, muddy colors, noisy \
                 edges, melted pixels, wrong hair color, changed hairstyle",
            )
            .without_face_fix(),
            StylePreset::single_step(
                "fairytale",
                &format!(
                    "Transform this photo into a magical fairytale illustration. Make the person an \
                     enchanted prince or princess wearing an ornate costume with sparkling details. \
                     Place them in an enchanted forest with glowing castle spires, floating lights, \
                     and lush flora. Use painterly rendering with luminous lighting. {}",
                    KEEP_LIKENESS
                ),
                &format!(
                    "deformed faces, blurry details, distorted anatomy, modern clothing, \
                     photorealistic skin, extra limbs, {}",
                    HAIR_NEGATIVES
                ),
            )
            .with_settings(GenerationSettings {
                denoising: 0.40,
                cfg_scale: 7.0,
                inference_steps: 28,
            })
            .shelved(),
            StylePreset::single_step(
                "superhero",
                &format!(
                    "Transform this photo into a heroic comic-book illustration. Dress the person in \
                     sleek superhero armor with a cape and bold emblem. Place them atop a futuristic \
                     skyline at dusk with dramatic clouds, energy flares, and vibrant neon city \
                     lights. Use cinematic rim lighting and a dynamic pose. {}",
                    KEEP_LIKENESS
                ),
                &format!(
                    "casual clothes, weak pose, low contrast, extra fingers, warped faces, grainy \
                     rendering, {}",
                    HAIR_NEGATIVES
                ),
            )
            .with_settings(GenerationSettings {
                denoising: 0.45,
                cfg_scale: 7.5,
                inference_steps: 32,
            })
            .shelved(),
        ])
    }

    pub fn get(&self, key: &str) -> Result<&StylePreset, RegistryError> {
        self.presets
            .get(&key.to_lowercase())
            .ok_or_else(|| RegistryError::UnknownStyle {
                requested: key.to_string(),
                available: self.keys().join(", "),
            })
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Styles offered to customers.
    pub fn active_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .presets
            .values()
            .filter(|preset| !preset.shelved)
            .map(|preset| preset.key.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for StyleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = StyleCatalog::builtin();
        let preset = catalog.get("Storybook_Cartoon").unwrap();
        assert_eq!(preset.key, DEFAULT_STYLE);
        assert!(preset.face_fix);
        assert_eq!(preset.mode, PipelineMode::SingleStep);
    }

    #[test]
    fn test_pixel_art_disables_face_fix() {
        let catalog = StyleCatalog::builtin();
        assert!(!catalog.get("pixel_platformer").unwrap().face_fix);
    }

    #[test]
    fn test_shelved_styles_resolve_but_are_not_active() {
        let catalog = StyleCatalog::builtin();
        assert!(catalog.get("fairytale").is_ok());
        assert_eq!(
            catalog.active_keys(),
            vec![
                "pixel_platformer",
                "space_explorer",
                "storybook_cartoon",
                "underwater_adventure"
            ]
        );
    }

    #[test]
    fn test_unknown_style_lists_available() {
        let catalog = StyleCatalog::builtin();
        match catalog.get("vaporwave") {
            Err(RegistryError::UnknownStyle { requested, available }) => {
                assert_eq!(requested, "vaporwave");
                assert!(available.contains("superhero"));
            }
            other => panic!("expected UnknownStyle, got {:?}", other),
        }
    }

    #[test]
    fn test_two_step_builder() {
        let preset = StylePreset::single_step("sketch", "draw", "none").two_step("color it in");
        assert!(preset.is_two_step());
    }
}
