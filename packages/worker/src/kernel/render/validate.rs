//! Magic-byte and size checks for render output.

use crate::kernel::jobs::JobKind;

use super::ImageFormat;

const PDF_SIGNATURE: &[u8] = b"%PDF-";
const PNG_SIGNATURE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_HEAD: &[u8] = &[0xFF, 0xD8];
const JPEG_TAIL: &[u8] = &[0xFF, 0xD9];

/// Below this size the output is suspicious but not necessarily broken;
/// renderers sometimes legitimately produce tiny files.
const MIN_PLAUSIBLE_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub size: usize,
    pub format_verified: bool,
}

/// Check render output against the expected artifact format.
pub fn validate_output(bytes: &[u8], kind: JobKind, image_format: ImageFormat) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut signature_matched = false;

    match kind {
        JobKind::Pdf => {
            if bytes.starts_with(PDF_SIGNATURE) {
                signature_matched = true;
            } else {
                errors.push("output does not start with %PDF-".to_string());
            }
        }
        JobKind::Image => match image_format {
            ImageFormat::Png => {
                if bytes.starts_with(PNG_SIGNATURE) {
                    signature_matched = true;
                } else {
                    errors.push("output does not carry a PNG signature".to_string());
                }
            }
            ImageFormat::Jpeg => {
                if bytes.starts_with(JPEG_HEAD) {
                    signature_matched = true;
                    if !bytes.ends_with(JPEG_TAIL) {
                        warnings.push("JPEG end marker missing; file may be truncated".to_string());
                    }
                } else {
                    errors.push("output does not carry a JPEG signature".to_string());
                }
            }
        },
    }

    if bytes.len() < MIN_PLAUSIBLE_SIZE {
        warnings.push(format!(
            "output is only {} bytes (below the {MIN_PLAUSIBLE_SIZE}-byte threshold)",
            bytes.len()
        ));
    }

    ValidationReport {
        ok: errors.is_empty(),
        format_verified: signature_matched && errors.is_empty(),
        size: bytes.len(),
        errors,
        warnings,
    }
}
