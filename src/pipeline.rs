//! File pipelines: a pattern set streamed through a chain of stages
//!
//! Each stage may carry its own [`Cache`]. Caches are owned by the stage and
//! survive between runs of the same pipeline, which is what makes watch-mode
//! rebuilds skip untouched files.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::cache::{Cache, CachedOutcome, CacheStats, FingerprintStrategy, Lookup};
use crate::error::{AssetflowError, Result};
use crate::pattern::PatternSet;
use crate::policy::ErrorPolicy;
use crate::transform::{Transform, TransformContext, TransformFailure};

/// One link in a pipeline
pub struct Stage {
    transform: Box<dyn Transform>,
    cache: Option<Cache>,
    debug_only: bool,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("transform", &self.transform.name())
            .field("cached", &self.cache.is_some())
            .field("debug_only", &self.debug_only)
            .finish()
    }
}

struct StageOutput {
    files: Vec<PathBuf>,
    cached: bool,
}

impl Stage {
    pub fn new(transform: impl Transform + 'static) -> Self {
        Self {
            transform: Box::new(transform),
            cache: None,
            debug_only: false,
        }
    }

    /// Memoise this stage per input file
    pub fn cached(mut self, strategy: FingerprintStrategy) -> Self {
        self.cache = Some(Cache::new(strategy));
        self
    }

    /// Only run this stage when the debug flag is set
    pub fn debug_only(mut self, debug_only: bool) -> Self {
        self.debug_only = debug_only;
        self
    }

    pub fn name(&self) -> &str {
        self.transform.name()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(Cache::stats)
    }

    async fn run(&mut self, input: &Path, ctx: &TransformContext<'_>) -> Result<StageOutput> {
        let Some(cache) = self.cache.as_mut() else {
            let files = self.transform.apply(input, ctx).await?;
            return Ok(StageOutput { files, cached: false });
        };

        let fingerprint = match cache.get(input)? {
            Lookup::Hit(outcome) if outputs_exist(&outcome) => {
                tracing::trace!(path = %input.display(), stage = self.transform.name(), "cache hit");
                let files = match outcome {
                    CachedOutcome::Outputs(files) => files,
                    CachedOutcome::Clean => vec![input.to_path_buf()],
                };
                return Ok(StageOutput { files, cached: true });
            }
            Lookup::Hit(_) => {
                cache.invalidate(input);
                cache.strategy().fingerprint(input)?
            }
            Lookup::Miss(fingerprint) => fingerprint,
        };

        let files = self.transform.apply(input, ctx).await?;
        let outcome = if files.len() == 1 && files[0] == input {
            CachedOutcome::Clean
        } else {
            CachedOutcome::Outputs(files.clone())
        };
        cache.put(input, fingerprint, outcome);

        Ok(StageOutput { files, cached: false })
    }
}

fn outputs_exist(outcome: &CachedOutcome) -> bool {
    match outcome {
        CachedOutcome::Outputs(files) => files.iter().all(|f| f.exists()),
        CachedOutcome::Clean => true,
    }
}

/// What one pipeline run did
#[derive(Debug, Default, Clone)]
pub struct PipelineReport {
    /// Source files selected by the pattern set
    pub files: usize,
    /// Stage invocations answered from a cache
    pub cached: usize,
    /// Files the final stage emitted
    pub outputs: Vec<PathBuf>,
    pub failures: Vec<TransformFailure>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A pattern set plus the ordered stages its files flow through
#[derive(Debug)]
pub struct Pipeline {
    patterns: PatternSet,
    stages: Mutex<Vec<Stage>>,
}

impl Pipeline {
    pub fn new(patterns: PatternSet, stages: Vec<Stage>) -> Self {
        Self {
            patterns,
            stages: Mutex::new(stages),
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Names of the stages, in order
    pub async fn stage_names(&self) -> Vec<String> {
        self.stages
            .lock()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Stream every matching file through the stages.
    ///
    /// Per-file failures are handed to `policy`; a lenient policy drops the
    /// failing file from the stream and records the failure, a strict one
    /// ends the run with [`AssetflowError::Aborted`].
    pub async fn process(&self, ctx: &TransformContext<'_>, policy: ErrorPolicy) -> Result<PipelineReport> {
        let mut stages = self.stages.lock().await;
        let sources: Vec<PathBuf> = self.patterns.files(ctx.root).collect();
        let mut report = PipelineReport {
            files: sources.len(),
            ..Default::default()
        };

        for source in sources {
            let mut current = vec![source];

            for stage in stages.iter_mut() {
                if stage.debug_only && !ctx.debug {
                    continue;
                }

                let mut next = Vec::new();
                for input in current {
                    match stage.run(&input, ctx).await {
                        Ok(output) => {
                            if output.cached {
                                report.cached += 1;
                            }
                            next.extend(output.files);
                        }
                        Err(error) if error.is_configuration() => return Err(error),
                        Err(error) => {
                            let failure = TransformFailure::new(ctx, stage.name(), &input, &error);
                            policy.on_failure(&AssetflowError::Transform(failure.clone()))?;
                            report.failures.push(failure);
                        }
                    }
                }

                current = next;
                if current.is_empty() {
                    break;
                }
            }

            report.outputs.extend(current);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::future::BoxFuture;

    /// Fails on files whose name contains "broken", counts invocations
    struct Linter {
        calls: Arc<AtomicUsize>,
    }

    impl Transform for Linter {
        fn name(&self) -> &str {
            "linter"
        }

        fn apply<'a>(
            &'a self,
            file: &'a Path,
            ctx: &'a TransformContext<'a>,
        ) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if file.to_string_lossy().contains("broken") {
                    return Err(AssetflowError::TaskFailed {
                        task: ctx.task.to_string(),
                        message: "syntax error".to_string(),
                        stderr: None,
                    });
                }
                Ok(vec![file.to_path_buf()])
            })
        }
    }

    fn fixture() -> (tempfile::TempDir, Pipeline, Arc<AtomicUsize>) {
        let temp = tempfile::tempdir().unwrap();
        let sass = temp.path().join("sass");
        std::fs::create_dir_all(&sass).unwrap();
        std::fs::write(sass.join("a.scss"), "a{}").unwrap();
        std::fs::write(sass.join("broken.scss"), "a{").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            PatternSet::new(["sass/**/*.scss"], Vec::<String>::new()).unwrap(),
            vec![Stage::new(Linter { calls: calls.clone() }).cached(FingerprintStrategy::MtimeSize)],
        );
        (temp, pipeline, calls)
    }

    #[tokio::test]
    async fn test_lenient_records_failure_and_continues() {
        let (temp, pipeline, _) = fixture();
        let env = HashMap::new();
        let ctx = TransformContext {
            root: temp.path(),
            task: "sass",
            env: &env,
            debug: false,
        };

        let report = pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.outputs, vec![temp.path().join("sass/a.scss")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, Some(PathBuf::from("sass/broken.scss")));
        assert_eq!(report.failures[0].transform, "linter");
    }

    #[tokio::test]
    async fn test_strict_aborts() {
        let (temp, pipeline, _) = fixture();
        let env = HashMap::new();
        let ctx = TransformContext {
            root: temp.path(),
            task: "sass",
            env: &env,
            debug: false,
        };

        let result = pipeline.process(&ctx, ErrorPolicy::Strict).await;
        assert!(matches!(result, Err(AssetflowError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_cache_skips_unchanged_files_across_runs() {
        let (temp, pipeline, calls) = fixture();
        let env = HashMap::new();
        let ctx = TransformContext {
            root: temp.path(),
            task: "sass",
            env: &env,
            debug: false,
        };

        pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // a.scss is cached as clean; broken.scss failed and is retried
        let report = pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.cached, 1);

        std::fs::write(temp.path().join("sass/a.scss"), "a{color:red}").unwrap();
        pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_debug_only_stage_skipped() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.scss"), "a{}").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            PatternSet::new(["*.scss"], Vec::<String>::new()).unwrap(),
            vec![Stage::new(Linter { calls: calls.clone() }).debug_only(true)],
        );

        let env = HashMap::new();
        let mut ctx = TransformContext {
            root: temp.path(),
            task: "sass",
            env: &env,
            debug: false,
        };
        pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        ctx.debug = true;
        pipeline.process(&ctx, ErrorPolicy::Lenient).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
