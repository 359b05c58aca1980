use crate::youtube::TranscriptSegment;

/// Format seconds as MM:SS timestamp
pub fn format_timestamp(seconds: f64) -> String {
    let mins = (seconds / 60.0) as u32;
    let secs = (seconds % 60.0) as u32;
    format!("{:02}:{:02}", mins, secs)
}

/// Format transcript segments with timestamps for prompt input
pub fn format_transcript_with_timestamps(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|seg| format!("[{}] {}", format_timestamp(seg.start), seg.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Approximate transcript duration in minutes, from the last segment.
pub fn transcript_duration_minutes(segments: &[TranscriptSegment]) -> f64 {
    segments
        .last()
        .map(|seg| (seg.start + seg.duration) / 60.0)
        .unwrap_or(0.0)
}
