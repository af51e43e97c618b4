//! Manifest assembly.
//!
//! Checks a completed job's rendition outputs against its requested
//! profiles, orders the usable ones and renders them. Rendering is a pure
//! function of the job: the body carries no version or timestamp, so
//! regenerating from an unchanged job is byte-identical.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::warn;

use sgate_models::{
    JobStatus, Manifest, ManifestType, RenditionOutput, RenditionProfile, RenditionStatus,
    TranscodeJob, Variant,
};

use crate::config::ManifestConfig;
use crate::error::{ManifestError, ManifestResult};
use crate::{dash, hls};

/// Media playlist file name inside each rendition directory.
pub const MEDIA_PLAYLIST: &str = "index.m3u8";

/// A variant together with the output and profile it was built from.
#[derive(Debug, Clone)]
pub struct VariantSource<'a> {
    pub variant: Variant,
    pub profile: &'a RenditionProfile,
    pub output: &'a RenditionOutput,
}

/// Usable renditions of a job, in manifest order.
#[derive(Debug)]
pub struct Assembly<'a> {
    pub sources: Vec<VariantSource<'a>>,
    /// Some requested renditions were left out
    pub partial: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ManifestGenerator {
    config: ManifestConfig,
}

impl ManifestGenerator {
    pub fn new(config: ManifestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ManifestConfig {
        &self.config
    }

    fn variant_uri(&self, profile: &RenditionProfile, manifest_type: ManifestType) -> String {
        match manifest_type {
            ManifestType::Hls => format!("{}{}/{}", self.config.base_uri, profile.name, MEDIA_PLAYLIST),
            ManifestType::Dash => format!("{}{}/", self.config.base_uri, profile.name),
        }
    }

    /// Validate the job's outputs and pick the variants to publish.
    pub fn assemble<'a>(
        &self,
        job: &'a TranscodeJob,
        manifest_type: ManifestType,
    ) -> ManifestResult<Assembly<'a>> {
        if job.status != JobStatus::Completed {
            return Err(ManifestError::NotCompleted {
                job_id: job.id.clone(),
                status: job.status,
            });
        }

        let profiles: BTreeMap<&str, &RenditionProfile> =
            job.profiles.iter().map(|p| (p.name.as_str(), p)).collect();

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for output in &job.renditions {
            *seen.entry(output.profile_name.as_str()).or_default() += 1;
        }

        let mut problems: Vec<String> = Vec::new();
        let mut usable: Vec<(&RenditionProfile, &RenditionOutput)> = Vec::new();
        let mut excluded: BTreeSet<&str> = BTreeSet::new();

        for output in &job.renditions {
            let name = output.profile_name.as_str();
            let Some(&profile) = profiles.get(name) else {
                problems.push(format!("output for unknown profile {}", name));
                continue;
            };
            if seen.get(name).copied().unwrap_or(0) > 1 {
                if excluded.insert(name) {
                    problems.push(format!("duplicate outputs for {}", name));
                }
                continue;
            }
            match output.status {
                RenditionStatus::Done if output.segments.is_empty() => {
                    problems.push(format!("rendition {} finished without segments", name));
                    excluded.insert(name);
                }
                RenditionStatus::Done => usable.push((profile, output)),
                status => {
                    problems.push(format!("rendition {} is {}", name, status.as_str()));
                    excluded.insert(name);
                }
            }
        }
        for profile in &job.profiles {
            if !seen.contains_key(profile.name.as_str()) {
                problems.push(format!("rendition {} has no output", profile.name));
            }
        }

        if !problems.is_empty() {
            let summary = problems.join("; ");
            if !self.config.partial_success {
                return Err(ManifestError::assembly(summary));
            }
            warn!(job_id = %job.id, "Building partial manifest: {}", summary);
        }
        if usable.is_empty() {
            return Err(ManifestError::assembly("no usable renditions"));
        }

        usable.sort_by(|(a, _), (b, _)| {
            b.bandwidth_bps()
                .cmp(&a.bandwidth_bps())
                .then_with(|| a.name.cmp(&b.name))
        });

        let partial = usable.len() < job.profiles.len();
        let sources = usable
            .into_iter()
            .map(|(profile, output)| VariantSource {
                variant: Variant {
                    profile_name: profile.name.clone(),
                    bandwidth: profile.bandwidth_bps(),
                    resolution: profile.resolution,
                    codecs: profile.codecs_string(),
                    uri: self.variant_uri(profile, manifest_type),
                },
                profile,
                output,
            })
            .collect();
        Ok(Assembly { sources, partial })
    }

    /// Build an unversioned manifest (version 1) for a completed job.
    pub fn generate(&self, job: &TranscodeJob, manifest_type: ManifestType) -> ManifestResult<Manifest> {
        let assembly = self.assemble(job, manifest_type)?;
        let body = match manifest_type {
            ManifestType::Hls => hls::master_playlist(&assembly.sources),
            ManifestType::Dash => dash::mpd(&assembly.sources),
        };
        Ok(Manifest {
            content_id: job.content_id.clone(),
            job_id: job.id.clone(),
            manifest_type,
            variants: assembly.sources.into_iter().map(|s| s.variant).collect(),
            version: 1,
            partial: assembly.partial,
            generated_at: Utc::now(),
            body,
        })
    }

    /// HLS media playlists of the published variants, keyed by profile name.
    pub fn media_playlists(&self, job: &TranscodeJob) -> ManifestResult<Vec<(String, String)>> {
        let assembly = self.assemble(job, ManifestType::Hls)?;
        Ok(assembly
            .sources
            .iter()
            .map(|s| {
                (
                    s.profile.name.clone(),
                    hls::media_playlist(s.output, s.profile.container),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_models::{Container, Segment, WorkerId};

    fn completed_job(names: &[&str]) -> TranscodeJob {
        let profiles = names
            .iter()
            .filter_map(|n| RenditionProfile::preset(n))
            .collect();
        let mut job = TranscodeJob::new("movie-42", "in.mkv", profiles, 3);
        job.assign(WorkerId::new()).unwrap();
        job.start().unwrap();
        for name in names {
            let output = job.rendition_mut(name).unwrap();
            output.finish(vec![
                Segment::new(format!("{}/seg-0.ts", name), 6.0),
                Segment::new(format!("{}/seg-1.ts", name), 3.5),
            ]);
        }
        job.complete().unwrap();
        job
    }

    #[test]
    fn test_variants_ordered_by_bandwidth() {
        let job = completed_job(&["480p", "1080p", "720p"]);
        let manifest = ManifestGenerator::default()
            .generate(&job, ManifestType::Hls)
            .unwrap();

        let names: Vec<_> = manifest.variants.iter().map(|v| v.profile_name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p"]);
        assert!(!manifest.partial);
        assert_eq!(manifest.variants[0].bandwidth, 5_000_000);
        assert_eq!(manifest.variants[0].codecs, "avc1.640028,mp4a.40.2");
    }

    #[test]
    fn test_equal_bandwidth_ties_break_by_name() {
        let mut job = completed_job(&["720p"]);
        let twin = RenditionProfile::new("720p-alt", sgate_models::Resolution::new(1280, 720), 2500);
        job.profiles.push(twin);
        let mut output = RenditionOutput::pending("720p-alt");
        output.finish(vec![Segment::new("alt/seg-0.ts", 6.0)]);
        job.renditions.push(output);

        let manifest = ManifestGenerator::default()
            .generate(&job, ManifestType::Dash)
            .unwrap();
        let names: Vec<_> = manifest.variants.iter().map(|v| v.profile_name.as_str()).collect();
        assert_eq!(names, ["720p", "720p-alt"]);
    }

    #[test]
    fn test_hls_master_body() {
        let job = completed_job(&["720p", "480p"]);
        let generator = ManifestGenerator::new(ManifestConfig::default().with_base_uri("https://cdn/x/"));
        let manifest = generator.generate(&job, ManifestType::Hls).unwrap();

        assert_eq!(
            manifest.body,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-INDEPENDENT-SEGMENTS\n\
             #EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\"\n\
             https://cdn/x/720p/index.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=854x480,CODECS=\"avc1.64001e,mp4a.40.2\"\n\
             https://cdn/x/480p/index.m3u8\n"
        );
    }

    #[test]
    fn test_regeneration_is_byte_identical() {
        let job = completed_job(&["1080p", "720p", "480p"]);
        let generator = ManifestGenerator::default();
        for manifest_type in [ManifestType::Hls, ManifestType::Dash] {
            let first = generator.generate(&job, manifest_type).unwrap();
            let second = generator.generate(&job, manifest_type).unwrap();
            assert_eq!(first.body, second.body);
            assert!(!first.body.contains(&first.generated_at.to_rfc3339()));
        }
    }

    #[test]
    fn test_dash_groups_by_container() {
        let mut job = completed_job(&["720p", "480p"]);
        job.profiles[1].container = Container::Fmp4;
        let manifest = ManifestGenerator::default()
            .generate(&job, ManifestType::Dash)
            .unwrap();

        assert!(manifest.body.contains("mediaPresentationDuration=\"PT9.500S\""));
        assert_eq!(manifest.body.matches("<AdaptationSet").count(), 2);
        assert!(manifest.body.contains("<S d=\"3500\"/>"));
        assert!(manifest.body.contains("<BaseURL>480p/</BaseURL>"));
    }

    #[test]
    fn test_incomplete_job_rejected() {
        let job = TranscodeJob::new("c", "in", vec![], 0);
        let err = ManifestGenerator::default()
            .generate(&job, ManifestType::Hls)
            .unwrap_err();
        assert!(matches!(err, ManifestError::NotCompleted { .. }));
    }

    #[test]
    fn test_failed_rendition_blocks_manifest_by_default() {
        let mut job = completed_job(&["1080p", "720p", "480p"]);
        job.rendition_mut("720p").unwrap().fail("encoder crashed");

        let err = ManifestGenerator::default()
            .generate(&job, ManifestType::Hls)
            .unwrap_err();
        assert!(err.is_assembly());
        assert!(err.to_string().contains("720p"));
    }

    #[test]
    fn test_partial_success_excludes_failed_rendition() {
        let mut job = completed_job(&["1080p", "720p", "480p"]);
        job.rendition_mut("720p").unwrap().fail("encoder crashed");

        let generator = ManifestGenerator::new(ManifestConfig::default().with_partial_success(true));
        let manifest = generator.generate(&job, ManifestType::Hls).unwrap();
        assert!(manifest.partial);
        let names: Vec<_> = manifest.variants.iter().map(|v| v.profile_name.as_str()).collect();
        assert_eq!(names, ["1080p", "480p"]);
        assert!(!manifest.body.contains("720p"));
    }

    #[test]
    fn test_inconsistent_outputs_raise_assembly_errors() {
        let generator = ManifestGenerator::default();

        let mut empty = completed_job(&["720p"]);
        empty.renditions[0].segments.clear();
        assert!(generator.generate(&empty, ManifestType::Hls).unwrap_err().is_assembly());

        let mut stray = completed_job(&["720p"]);
        let mut output = RenditionOutput::pending("4k");
        output.finish(vec![Segment::new("4k/seg-0.ts", 6.0)]);
        stray.renditions.push(output);
        assert!(generator.generate(&stray, ManifestType::Hls).unwrap_err().is_assembly());

        let mut duplicated = completed_job(&["720p", "480p"]);
        let copy = duplicated.renditions[0].clone();
        duplicated.renditions.push(copy);
        assert!(generator.generate(&duplicated, ManifestType::Hls).unwrap_err().is_assembly());

        // Partial success drops the duplicate and keeps the rest.
        let partial = ManifestGenerator::new(ManifestConfig::default().with_partial_success(true));
        let manifest = partial.generate(&duplicated, ManifestType::Hls).unwrap();
        assert_eq!(manifest.variants.len(), 1);
        assert_eq!(manifest.variants[0].profile_name, "480p");
    }

    #[test]
    fn test_media_playlists_follow_variant_order() {
        let job = completed_job(&["480p", "720p"]);
        let playlists = ManifestGenerator::default().media_playlists(&job).unwrap();
        assert_eq!(playlists.len(), 2);
        assert_eq!(playlists[0].0, "720p");
        assert!(playlists[0].1.contains("720p/seg-0.ts"));
        assert!(playlists[0].1.contains("#EXT-X-TARGETDURATION:6"));
    }
}
