//! MPEG-DASH MPD rendering.
//!
//! One static period; one adaptation set per MIME type, each representation
//! carrying an explicit segment list with a millisecond timeline.

use std::fmt::Write;

use crate::generator::VariantSource;

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// ISO 8601 duration with millisecond precision.
fn iso_duration(secs: f64) -> String {
    format!("PT{:.3}S", secs.max(0.0))
}

pub fn mpd(sources: &[VariantSource<'_>]) -> String {
    let duration = sources
        .iter()
        .map(|s| s.output.total_duration_secs())
        .fold(0.0_f64, f64::max);

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"static\" \
         profiles=\"urn:mpeg:dash:profile:isoff-on-demand:2011\" minBufferTime=\"PT2S\" \
         mediaPresentationDuration=\"{}\">",
        iso_duration(duration)
    );
    out.push_str("  <Period id=\"0\">\n");

    // Adaptation sets in order of first appearance, so variant order decides.
    let mut mime_types: Vec<&'static str> = Vec::new();
    for source in sources {
        let mime = source.profile.container.mime_type();
        if !mime_types.contains(&mime) {
            mime_types.push(mime);
        }
    }

    for (set_id, mime) in mime_types.iter().enumerate() {
        let _ = writeln!(
            out,
            "    <AdaptationSet id=\"{}\" contentType=\"video\" mimeType=\"{}\" segmentAlignment=\"true\">",
            set_id, mime
        );
        for source in sources.iter().filter(|s| s.profile.container.mime_type() == *mime) {
            let v = &source.variant;
            let _ = writeln!(
                out,
                "      <Representation id=\"{}\" bandwidth=\"{}\" width=\"{}\" height=\"{}\" codecs=\"{}\">",
                escape_xml(&v.profile_name),
                v.bandwidth,
                v.resolution.width,
                v.resolution.height,
                escape_xml(&v.codecs)
            );
            let _ = writeln!(out, "        <BaseURL>{}</BaseURL>", escape_xml(&v.uri));
            out.push_str("        <SegmentList timescale=\"1000\">\n");
            out.push_str("          <SegmentTimeline>\n");
            for segment in &source.output.segments {
                let millis = (segment.duration_secs * 1000.0).round() as u64;
                let _ = writeln!(out, "            <S d=\"{}\"/>", millis);
            }
            out.push_str("          </SegmentTimeline>\n");
            for segment in &source.output.segments {
                let _ = writeln!(out, "          <SegmentURL media=\"{}\"/>", escape_xml(&segment.uri));
            }
            out.push_str("        </SegmentList>\n");
            out.push_str("      </Representation>\n");
        }
        out.push_str("    </AdaptationSet>\n");
    }

    out.push_str("  </Period>\n");
    out.push_str("</MPD>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a&b<c>\"d'"), "a&amp;b&lt;c&gt;&quot;d&apos;");
    }

    #[test]
    fn test_iso_duration() {
        assert_eq!(iso_duration(10.5), "PT10.500S");
        assert_eq!(iso_duration(-1.0), "PT0.000S");
    }
}
