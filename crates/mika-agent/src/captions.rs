//! Two-stage media handling: when the model cannot (or should not) see
//! images directly, an external captioner describes them and the captions
//! ride along as an untrusted system-injection block.

use async_trait::async_trait;

use mika_core::media::placeholder_for_url;

pub const CAPTION_BLOCK_LABEL: &str = "[Context Media Captions | Untrusted]";

/// External captioning seam (the actual vision call lives outside the
/// core). `None` means the image could not be captioned.
#[async_trait]
pub trait CaptionProvider: Send + Sync {
    async fn caption(&self, image_url: &str) -> Option<String>;
}

/// Caption up to `max_images` and render the injection block. Images with
/// no caption keep only their stable placeholder line.
pub async fn build_caption_injection(
    provider: &dyn CaptionProvider,
    image_urls: &[String],
    max_images: usize,
) -> Option<String> {
    if image_urls.is_empty() || max_images == 0 {
        return None;
    }
    let mut lines: Vec<String> = Vec::new();
    for url in image_urls.iter().take(max_images) {
        let tag = placeholder_for_url(url);
        match provider.caption(url).await {
            Some(caption) if !caption.trim().is_empty() => {
                lines.push(format!("- {}: {}", tag, caption.trim()));
            }
            _ => lines.push(format!("- {}", tag)),
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("{}\n{}", CAPTION_BLOCK_LABEL, lines.join("\n")))
}
