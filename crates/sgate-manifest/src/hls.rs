//! HLS playlist rendering.

use std::fmt::Write;

use sgate_models::{Container, RenditionOutput};

use crate::generator::VariantSource;

/// fMP4 segments need protocol version 7.
fn protocol_version<'a>(containers: impl IntoIterator<Item = &'a Container>) -> u8 {
    if containers.into_iter().any(|c| *c == Container::Fmp4) {
        7
    } else {
        3
    }
}

/// Master playlist listing every variant, in the order given.
pub fn master_playlist(sources: &[VariantSource<'_>]) -> String {
    let version = protocol_version(sources.iter().map(|s| &s.profile.container));
    let mut out = String::from("#EXTM3U\n");
    let _ = writeln!(out, "#EXT-X-VERSION:{}", version);
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");

    for source in sources {
        let v = &source.variant;
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},CODECS=\"{}\"",
            v.bandwidth, v.resolution, v.codecs
        );
        let _ = writeln!(out, "{}", v.uri);
    }
    out
}

/// VOD media playlist for one rendition.
pub fn media_playlist(output: &RenditionOutput, container: Container) -> String {
    let mut out = String::from("#EXTM3U\n");
    let _ = writeln!(out, "#EXT-X-VERSION:{}", protocol_version([&container]));
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", output.target_duration_secs());
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    for segment in &output.segments {
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
        let _ = writeln!(out, "{}", segment.uri);
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_models::Segment;

    #[test]
    fn test_media_playlist() {
        let mut output = RenditionOutput::pending("720p");
        output.finish(vec![Segment::new("seg-0.ts", 6.0), Segment::new("seg-1.ts", 4.2)]);

        let body = media_playlist(&output, Container::Ts);
        assert_eq!(
            body,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:6\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-PLAYLIST-TYPE:VOD\n\
             #EXTINF:6.000,\n\
             seg-0.ts\n\
             #EXTINF:4.200,\n\
             seg-1.ts\n\
             #EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn test_fmp4_bumps_version() {
        let output = RenditionOutput::pending("720p");
        assert!(media_playlist(&output, Container::Fmp4).contains("#EXT-X-VERSION:7\n"));
    }
}
