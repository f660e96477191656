use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};

use crate::plans::{Operation, Tier};

/// Upscale factor. Anything above 2x consumes the 4x quota budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    X2,
    X3,
    X4,
}

impl Scale {
    /// Accepts `2`, `2x`, `4X`, etc. Unknown values fall back to 2x, the
    /// cheapest scale.
    pub fn parse(raw: Option<&str>) -> Self {
        let normalized = raw.unwrap_or_default().trim().to_ascii_lowercase();
        match normalized.trim_end_matches('x') {
            "3" => Scale::X3,
            "4" => Scale::X4,
            _ => Scale::X2,
        }
    }

    pub fn factor(self) -> u32 {
        match self {
            Scale::X2 => 2,
            Scale::X3 => 3,
            Scale::X4 => 4,
        }
    }

    pub fn label(self) -> String {
        format!("{}x", self.factor())
    }

    pub fn operation(self) -> Operation {
        match self {
            Scale::X2 => Operation::Upscale2x,
            Scale::X3 | Scale::X4 => Operation::Upscale4x,
        }
    }

    /// Longest-side cap for the input image, in pixels. Larger scales get
    /// smaller inputs to keep output sizes and processing time bounded.
    pub fn max_input_dimension(self) -> u32 {
        match self {
            Scale::X2 => 2048,
            Scale::X3 => 1536,
            Scale::X4 => 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Realesrgan,
    RealesrganFast,
    RealesrganAnime,
    Edsr,
    Fsrcnn,
    Espcn,
}

impl ModelType {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "realesrgan" => ModelType::Realesrgan,
            "realesrgan-anime" => ModelType::RealesrganAnime,
            "edsr" => ModelType::Edsr,
            "fsrcnn" => ModelType::Fsrcnn,
            "espcn" => ModelType::Espcn,
            _ => ModelType::RealesrganFast,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Realesrgan => "realesrgan",
            ModelType::RealesrganFast => "realesrgan-fast",
            ModelType::RealesrganAnime => "realesrgan-anime",
            ModelType::Edsr => "edsr",
            ModelType::Fsrcnn => "fsrcnn",
            ModelType::Espcn => "espcn",
        }
    }

    /// The full Real-ESRGAN model is gated behind paid tiers.
    pub fn requires_pro(self) -> bool {
        self == ModelType::Realesrgan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "png" => OutputFormat::Png,
            "webp" => OutputFormat::Webp,
            _ => OutputFormat::Jpg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }
}

/// Parameter blob for `resize` jobs, serialized as the camelCase JSON the
/// processing script expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    pub resize_type: String,
    pub percentage: u32,
    pub width: u32,
    pub height: u32,
    pub maintain_aspect: bool,
    pub quality: u8,
}

impl ResizeParams {
    pub fn from_fields(fields: &crate::upload::ImageFormFields) -> Result<Self, String> {
        let resize_type = match fields
            .resize_type
            .as_deref()
            .unwrap_or("percentage")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "percentage" => "percentage".to_string(),
            "pixels" => "pixels".to_string(),
            other => return Err(format!("Invalid resizeType: {other}")),
        };

        let percentage = parse_u32(fields.percentage.as_deref(), 100);
        if resize_type == "percentage" && !(1..=100).contains(&percentage) {
            return Err("percentage must be between 1 and 100".to_string());
        }

        let width = parse_u32(fields.width.as_deref(), 800);
        let height = parse_u32(fields.height.as_deref(), 600);
        if resize_type == "pixels" && (width == 0 || height == 0) {
            return Err("width and height must be positive".to_string());
        }

        let quality = parse_u32(fields.quality.as_deref(), 90);
        if !(1..=100).contains(&quality) {
            return Err("quality must be between 1 and 100".to_string());
        }

        let maintain_aspect = fields
            .maintain_aspect
            .as_deref()
            .map(|value| value.trim() != "false")
            .unwrap_or(true);

        Ok(Self {
            resize_type,
            percentage,
            width,
            height,
            maintain_aspect,
            quality: quality as u8,
        })
    }
}

/// Parameter blob for `upscale` jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleParams {
    pub model: String,
    pub model_type: String,
    pub tier: String,
}

impl UpscaleParams {
    pub fn new(scale: Scale, model_type: ModelType, tier: Tier) -> Self {
        Self {
            model: scale.label(),
            model_type: model_type.as_str().to_string(),
            tier: tier.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// Handle to the external Python processor. One subprocess per call,
/// bounded by a hard timeout; a hung processor is killed rather than
/// hanging the request forever.
#[derive(Clone, Debug)]
pub struct ImageProcessor {
    python_bin: String,
    script: String,
    command_timeout: Duration,
}

impl ImageProcessor {
    pub fn new(python_bin: String, script: &Path, command_timeout: Duration) -> Self {
        Self {
            python_bin,
            script: script.to_string_lossy().to_string(),
            command_timeout,
        }
    }

    /// Runs one processing job: `<script> <input> <output> <mode> <json>`.
    /// On success the output file exists at `output_path`.
    pub async fn run<P: Serialize>(
        &self,
        input_path: &Path,
        output_path: &Path,
        mode: &str,
        params: &P,
    ) -> anyhow::Result<()> {
        let params_json =
            serde_json::to_string(params).context("failed to serialize processor parameters")?;
        let args = vec![
            self.script.clone(),
            input_path.to_string_lossy().to_string(),
            output_path.to_string_lossy().to_string(),
            mode.to_string(),
            params_json,
        ];

        let (stdout, _stderr) = self.run_command(&args).await?;
        if !stdout.trim().is_empty() {
            tracing::debug!(output = %stdout.trim(), "processor output");
        }

        Ok(())
    }

    /// Reads the pixel dimensions of an image via a cv2 one-liner. Used
    /// for the dimensions endpoint and the pre-upscale size cap.
    pub async fn probe_dimensions(&self, input_path: &Path) -> anyhow::Result<ImageDimensions> {
        let escaped = input_path.to_string_lossy().replace('\\', "\\\\");
        let snippet = format!(
            "import cv2; import json; img = cv2.imread(\"{escaped}\"); \
             h, w = img.shape[:2]; print(json.dumps({{\"width\": w, \"height\": h}}))"
        );
        let args = vec!["-c".to_string(), snippet];

        let (stdout, _stderr) = self.run_command(&args).await?;
        serde_json::from_str(stdout.trim()).context("failed to parse image dimensions")
    }

    async fn run_command(&self, args: &[String]) -> anyhow::Result<(String, String)> {
        let child = Command::new(&self.python_bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to execute {}", self.python_bin))?;

        let output = timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} timed out after {} ms",
                    self.python_bin,
                    self.command_timeout.as_millis()
                )
            })?
            .with_context(|| format!("failed to execute {}", self.python_bin))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let message = stderr.trim();
            let fallback = stdout.trim();
            let reason = if message.is_empty() {
                if fallback.is_empty() {
                    format!("{} failed with status {}", self.python_bin, output.status)
                } else {
                    fallback.to_string()
                }
            } else {
                message.to_string()
            };

            return Err(anyhow!(reason));
        }

        Ok((stdout, stderr))
    }
}

pub fn sanitize_base_name(value: &str) -> String {
    static NON_SAFE_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"[^a-zA-Z0-9_-]+").expect("valid regex"));
    static EDGE_UNDERSCORE_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^_+|_+$").expect("valid regex"));

    let replaced = NON_SAFE_RE.replace_all(value, "_");
    let trimmed = EDGE_UNDERSCORE_RE.replace_all(&replaced, "");
    let output = trimmed.to_string();
    if output.is_empty() {
        "image".to_string()
    } else {
        output.chars().take(80).collect()
    }
}

pub fn sanitize_filename_for_header(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_u32(value: Option<&str>, fallback: u32) -> u32 {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::ImageFormFields;

    #[test]
    fn scale_parsing_defaults_to_2x() {
        assert_eq!(Scale::parse(Some("2x")), Scale::X2);
        assert_eq!(Scale::parse(Some("3")), Scale::X3);
        assert_eq!(Scale::parse(Some("4X")), Scale::X4);
        assert_eq!(Scale::parse(Some("16x")), Scale::X2);
        assert_eq!(Scale::parse(None), Scale::X2);
    }

    #[test]
    fn scales_above_2x_bill_against_the_4x_budget() {
        assert_eq!(Scale::X2.operation(), crate::plans::Operation::Upscale2x);
        assert_eq!(Scale::X3.operation(), crate::plans::Operation::Upscale4x);
        assert_eq!(Scale::X4.operation(), crate::plans::Operation::Upscale4x);
    }

    #[test]
    fn dimension_caps_shrink_as_scale_grows() {
        assert_eq!(Scale::X2.max_input_dimension(), 2048);
        assert_eq!(Scale::X3.max_input_dimension(), 1536);
        assert_eq!(Scale::X4.max_input_dimension(), 1024);
    }

    #[test]
    fn model_type_parsing_defaults_to_fast() {
        assert_eq!(ModelType::parse(Some("realesrgan")), ModelType::Realesrgan);
        assert_eq!(ModelType::parse(Some("edsr")), ModelType::Edsr);
        assert_eq!(ModelType::parse(Some("unknown")), ModelType::RealesrganFast);
        assert_eq!(ModelType::parse(None), ModelType::RealesrganFast);
        assert!(ModelType::Realesrgan.requires_pro());
        assert!(!ModelType::Edsr.requires_pro());
    }

    #[test]
    fn output_format_defaults_to_jpg() {
        assert_eq!(OutputFormat::parse(Some("png")).extension(), "png");
        assert_eq!(OutputFormat::parse(Some("webp")).content_type(), "image/webp");
        assert_eq!(OutputFormat::parse(Some("bmp")).extension(), "jpg");
        assert_eq!(OutputFormat::parse(None).content_type(), "image/jpeg");
    }

    #[test]
    fn resize_params_serialize_camel_case() {
        let fields = ImageFormFields {
            resize_type: Some("pixels".to_string()),
            width: Some("640".to_string()),
            height: Some("480".to_string()),
            maintain_aspect: Some("false".to_string()),
            quality: Some("75".to_string()),
            ..Default::default()
        };
        let params = ResizeParams::from_fields(&fields).unwrap();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["resizeType"], "pixels");
        assert_eq!(json["width"], 640);
        assert_eq!(json["height"], 480);
        assert_eq!(json["maintainAspect"], false);
        assert_eq!(json["quality"], 75);
    }

    #[test]
    fn resize_params_reject_bad_input() {
        let quality = ImageFormFields {
            quality: Some("0".to_string()),
            ..Default::default()
        };
        assert!(ResizeParams::from_fields(&quality).is_err());

        let resize_type = ImageFormFields {
            resize_type: Some("diagonal".to_string()),
            ..Default::default()
        };
        assert!(ResizeParams::from_fields(&resize_type).is_err());

        let percentage = ImageFormFields {
            percentage: Some("250".to_string()),
            ..Default::default()
        };
        assert!(ResizeParams::from_fields(&percentage).is_err());
    }

    #[test]
    fn resize_params_defaults() {
        let params = ResizeParams::from_fields(&ImageFormFields::default()).unwrap();
        assert_eq!(params.resize_type, "percentage");
        assert_eq!(params.percentage, 100);
        assert_eq!(params.width, 800);
        assert_eq!(params.height, 600);
        assert!(params.maintain_aspect);
        assert_eq!(params.quality, 90);
    }

    #[test]
    fn upscale_params_carry_scale_model_and_tier() {
        let params = UpscaleParams::new(Scale::X4, ModelType::Edsr, crate::plans::Tier::Pro);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["model"], "4x");
        assert_eq!(json["modelType"], "edsr");
        assert_eq!(json["tier"], "pro");
    }

    #[test]
    fn sanitize_base_name_strips_unsafe_chars() {
        assert_eq!(sanitize_base_name("my photo (1).jpg"), "my_photo_1_jpg");
        assert_eq!(sanitize_base_name("___"), "image");
        assert_eq!(sanitize_base_name(""), "image");
    }

    #[test]
    fn header_filenames_never_contain_quotes() {
        let sanitized = sanitize_filename_for_header("up\"scaled 2x.jpg");
        assert!(!sanitized.contains('"'));
        assert!(!sanitized.contains(' '));
    }
}
