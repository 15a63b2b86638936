//! Storyboard text planning: scene prompts, narration, subtitles.

use crate::collaborators::Project;

/// Narration line repeated once the brief's own lines run out.
const FILLER_LINE: &str = "Act now. Limited momentum window.";

/// Subtitle used when the narration has no sentences.
const EMPTY_NARRATION_SUBTITLE: &str = "Your ad is ready";

/// One image prompt per scene.
pub fn scene_prompts(project: &Project, style_prompt: &str, count: u32) -> Vec<String> {
    (1..=count)
        .map(|n| {
            format!(
                "{style_prompt}. Scene {n}: {} for {}. Tone: {}. Offer: {}.",
                project.product, project.audience, project.tone, project.offer
            )
        })
        .collect()
}

/// Voiceover script with one line per scene.
pub fn narration_script(project: &Project, scene_count: u32) -> String {
    let mut lines = vec![
        format!("{} presents {}.", project.brand_name, project.product),
        format!("Built for {}.", project.audience),
        format!("Get started with {}.", project.offer),
        "Tap now and launch your next result today.".to_string(),
    ];
    let count = scene_count as usize;
    if count > lines.len() {
        lines.resize(count, FILLER_LINE.to_string());
    }
    lines.truncate(count);
    lines.join(" ")
}

/// SRT subtitles splitting `narration` into sentences spread evenly over
/// `duration_sec`. The last cue always ends at `duration_sec`, and no cue
/// starts after it.
pub fn subtitles_srt(narration: &str, duration_sec: u32) -> String {
    let mut chunks: Vec<&str> = narration
        .split('.')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if chunks.is_empty() {
        chunks.push(EMPTY_NARRATION_SUBTITLE);
    }

    let per_chunk = (duration_sec / chunks.len() as u32).max(1);
    let last = chunks.len() - 1;

    let mut out = String::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        let start = (idx as u32 * per_chunk).min(duration_sec);
        let end = if idx == last {
            duration_sec
        } else {
            ((idx as u32 + 1) * per_chunk).min(duration_sec)
        };
        out.push_str(&format!(
            "{}\n{} --> {}\n{chunk}.\n\n",
            idx + 1,
            srt_timestamp(start),
            srt_timestamp(end)
        ));
    }
    // Cues are separated by a blank line; the file ends after the last text.
    out.pop();
    out
}

/// `HH:MM:SS,000` for a whole number of seconds.
pub fn srt_timestamp(total_sec: u32) -> String {
    format!(
        "{:02}:{:02}:{:02},000",
        total_sec / 3600,
        (total_sec % 3600) / 60,
        total_sec % 60
    )
}
