use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::browser::PageSession;
use crate::cli::config::{EngineConfig, ExplorerSettings};
use crate::error::ScrapeError;
use crate::explorer::state::{ExplorationState, ScrapeOutcome, TerminationReason};
use crate::extraction::{
    ApiStrategy, ExtractionChain, ExtractionStrategy, HistoryAssessment, HistoryEvaluator, HtmlModelStrategy,
    HtmlStrategy, RegexFallback, VisionStrategy,
};
use crate::oracle::Oracles;
use crate::extraction::BillingRecord;
use crate::page::{
    common_route_options, extract_options, rank, NavigationOption, NavigationScorer, PageClassification,
    PageClassifier, PageSnapshot, RecommendedAction,
};
use crate::utils::MetricsCollector;

/// Where the controller is in one exploration step
#[derive(Debug)]
enum Phase {
    Start,
    Classifying(PageSnapshot),
    Extracting(PageSnapshot),
    Navigating(PageSnapshot),
    Done(TerminationReason),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Start => "START",
            Phase::Classifying(_) => "CLASSIFYING",
            Phase::Extracting(_) => "EXTRACTING",
            Phase::Navigating(_) => "NAVIGATING",
            Phase::Done(_) => "DONE",
        }
    }
}

/// Outcome of trying one navigation option
enum Attempt {
    Landed(PageSnapshot),
    Failed,
}

/// Every component one scrape needs, built once from the configuration.
pub struct Engine {
    settings: ExplorerSettings,
    classifier: PageClassifier,
    scorer: NavigationScorer,
    chain: ExtractionChain,
    evaluator: HistoryEvaluator,
    metrics: MetricsCollector,
}

impl Engine {
    pub fn new(config: &EngineConfig, oracles: Oracles) -> Self {
        let metrics = MetricsCollector::new();
        let timeout = config.oracle.timeout();
        let explorer = &config.explorer;

        let classifier = PageClassifier::new(
            oracles.text.clone(),
            oracles.vision.clone(),
            timeout,
            explorer.max_prompt_chars,
            metrics.clone(),
        );
        let scorer = NavigationScorer::new(
            oracles.text.clone(),
            timeout,
            explorer.max_prompt_chars,
            explorer.max_scored_options,
            metrics.clone(),
        );

        let evaluator = HistoryEvaluator::new(
            oracles.text.clone(),
            timeout,
            explorer.max_prompt_chars,
            explorer.min_history_months,
            metrics.clone(),
        );

        let mut strategies: Vec<Box<dyn ExtractionStrategy>> = vec![
            Box::new(ApiStrategy::new(config.extraction.clone())),
            Box::new(HtmlStrategy::new(config.extraction.clone())),
            Box::new(HtmlModelStrategy::new(
                oracles.text.clone(),
                timeout,
                explorer.max_prompt_chars,
                config.extraction.clone(),
                metrics.clone(),
            )),
        ];
        if let Some(vision) = oracles.vision {
            strategies.push(Box::new(VisionStrategy::new(
                vision,
                timeout,
                config.extraction.clone(),
                metrics.clone(),
            )));
        }
        let chain = ExtractionChain::new(
            strategies,
            RegexFallback::new(config.extraction.clone()),
            explorer.min_strategy_confidence,
            metrics.clone(),
        );

        Self::from_parts(explorer.clone(), classifier, scorer, chain, evaluator, metrics)
    }

    pub fn from_parts(
        settings: ExplorerSettings,
        classifier: PageClassifier,
        scorer: NavigationScorer,
        chain: ExtractionChain,
        evaluator: HistoryEvaluator,
        metrics: MetricsCollector,
    ) -> Self {
        Self { settings, classifier, scorer, chain, evaluator, metrics }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run every component once on the page the session shows, without navigating.
    pub async fn analyze(&self, session: &dyn PageSession) -> Result<PageReport, ScrapeError> {
        let snapshot = PageSnapshot::capture(session, 1, self.settings.capture_screenshots).await?;
        let classification = self.classifier.classify(&snapshot, &snapshot.url).await;
        let record = self.chain.extract(&snapshot, session).await;
        let history = match &record {
            Some(_) => Some(self.evaluator.evaluate(&snapshot).await),
            None => None,
        };

        let mut options = extract_options(&snapshot);
        if options.is_empty() && self.settings.try_common_routes {
            options = common_route_options(&snapshot);
        }
        let options = rank(self.scorer.score(options, &snapshot, &snapshot.url).await);

        Ok(PageReport {
            url: snapshot.url,
            classification,
            record,
            history,
            options,
        })
    }
}

/// Everything the engine concludes about a single page
#[derive(Debug, Clone, Serialize)]
pub struct PageReport {
    pub url: String,
    pub classification: PageClassification,
    pub record: Option<BillingRecord>,
    /// Only judged when a record was found
    pub history: Option<HistoryAssessment>,
    /// Best first
    pub options: Vec<NavigationOption>,
}

/// Explore an authenticated site from the page the session is showing
/// until billing data is found with enough confidence or a bound is hit.
///
/// Oracle failures, empty pages and failed navigations all end in an
/// outcome; only a lost session is returned as an error.
pub async fn run_scrape(session: &mut dyn PageSession, engine: &Engine) -> Result<ScrapeOutcome, ScrapeError> {
    let span = info_span!("scrape", run_id = %Uuid::new_v4());
    async move {
        let mut state = ExplorationState::new();
        let mut phase = Phase::Start;

        let reason = loop {
            debug!("Exploration phase {} (depth {})", phase.name(), state.depth);
            phase = match phase {
                Phase::Start => Phase::Classifying(land(session, engine, &mut state).await?),
                Phase::Classifying(snapshot) => classify(engine, snapshot).await,
                Phase::Extracting(snapshot) => extract(session, engine, &mut state, snapshot).await,
                Phase::Navigating(snapshot) => navigate(session, engine, &mut state, snapshot).await?,
                Phase::Done(reason) => break reason,
            };
        };

        let metrics = engine.metrics.get_metrics().await;
        let outcome = state.finish(reason, metrics);
        info!(
            "Scrape finished: {} after {} pages, record {}",
            outcome.terminated_reason,
            outcome.pages_visited,
            outcome
                .billing_record
                .as_ref()
                .map_or("none".to_string(), |r| format!("from {} (confidence {})", r.source_strategy, r.confidence))
        );
        info!(
            "Run metrics: {} page loads, {} navigation failures, {} oracle failures, {} ms",
            outcome.metrics.page_loads,
            outcome.metrics.navigation_failures,
            outcome.metrics.total_oracle_failures(),
            outcome.metrics.elapsed_ms()
        );
        Ok(outcome)
    }
    .instrument(span)
    .await
}

/// Capture the landing page the caller left the session on.
async fn land(
    session: &mut dyn PageSession,
    engine: &Engine,
    state: &mut ExplorationState,
) -> Result<PageSnapshot, ScrapeError> {
    let timer = engine.metrics.start_timer();
    let snapshot = PageSnapshot::capture(&*session, 1, engine.settings.capture_screenshots)
        .await
        .map_err(|e| {
            if e.is_fatal() {
                ScrapeError::from(e)
            } else {
                ScrapeError::SessionFatal(format!("landing page unreadable: {}", e))
            }
        })?;
    engine.metrics.record_page_load(&snapshot.url, timer.end()).await;
    state.visited.insert(&snapshot.url, snapshot.content_hash());
    state.depth = 1;
    info!("Starting exploration at {}", snapshot.url);
    Ok(snapshot)
}

async fn classify(engine: &Engine, snapshot: PageSnapshot) -> Phase {
    let classification = engine.classifier.classify(&snapshot, &snapshot.url).await;

    let extract = matches!(
        classification.recommended_action,
        RecommendedAction::Extract | RecommendedAction::Stop
    ) || classification.has_billing_data
        || classification.is_degraded();

    if classification.is_degraded() {
        debug!("Classifier degraded on {}, attempting extraction anyway", snapshot.url);
    }
    if extract {
        Phase::Extracting(snapshot)
    } else {
        Phase::Navigating(snapshot)
    }
}

async fn extract(
    session: &mut dyn PageSession,
    engine: &Engine,
    state: &mut ExplorationState,
    snapshot: PageSnapshot,
) -> Phase {
    match engine.chain.extract(&snapshot, &*session).await {
        Some(record) if record.confidence >= engine.settings.stop_threshold => {
            info!(
                "High-confidence billing data on {} (confidence {})",
                snapshot.url, record.confidence
            );
            state.offer(record);
            Phase::Done(TerminationReason::HighConfidenceFound)
        }
        Some(mut record) => {
            if record.months_covered() >= engine.evaluator.min_months() as usize {
                let assessment = engine.evaluator.evaluate(&snapshot).await;
                if assessment.sufficient {
                    info!(
                        "{} months of billing history confirmed on {}, stopping",
                        assessment.months_found, snapshot.url
                    );
                    record.confidence = record.confidence.max(engine.settings.stop_threshold);
                    state.offer(record);
                    return Phase::Done(TerminationReason::HighConfidenceFound);
                }
            }
            debug!(
                "Extraction confidence {} below stopping threshold {}",
                record.confidence, engine.settings.stop_threshold
            );
            state.offer(record);
            Phase::Navigating(snapshot)
        }
        None => {
            debug!("No billing data on {}", snapshot.url);
            Phase::Navigating(snapshot)
        }
    }
}

async fn navigate(
    session: &mut dyn PageSession,
    engine: &Engine,
    state: &mut ExplorationState,
    snapshot: PageSnapshot,
) -> Result<Phase, ScrapeError> {
    if state.depth >= engine.settings.depth_ceiling {
        info!("Depth ceiling of {} pages reached", engine.settings.depth_ceiling);
        return Ok(Phase::Done(TerminationReason::DepthExceeded));
    }

    let expanded = if engine.settings.expand_menus {
        reveal_menus(session, &snapshot).await?
    } else {
        None
    };
    let page = expanded.as_ref().unwrap_or(&snapshot);

    let mut options = extract_options(page);
    if options.is_empty() && engine.settings.try_common_routes {
        options = common_route_options(page);
        if !options.is_empty() {
            debug!("No links on {}, probing {} common billing routes", snapshot.url, options.len());
        }
    }
    let candidates: Vec<NavigationOption> = options
        .into_iter()
        .filter(|option| !state.visited.was_attempted(&option.attempt_key(&snapshot.url)))
        .filter(|option| {
            option
                .destination
                .as_deref()
                .map_or(true, |destination| !state.visited.contains_url(destination))
        })
        .collect();
    if candidates.is_empty() {
        info!("No unvisited navigation options on {}", snapshot.url);
        return Ok(Phase::Done(TerminationReason::NoNavigationOptions));
    }

    let ranked = rank(engine.scorer.score(candidates, page, &snapshot.url).await);
    let mut page_disturbed = false;

    for option in &ranked {
        if !state.visited.mark_attempted(&option.attempt_key(&snapshot.url)) {
            continue;
        }

        // Clicks need the originating page back after a failed attempt
        if page_disturbed && option.is_click() {
            if let Err(e) = session.goto(&snapshot.url).await {
                if e.is_fatal() {
                    return Err(e.into());
                }
                warn!("Could not return to {} before clicking '{}': {}", snapshot.url, option.text, e);
                engine.metrics.record_navigation_failure().await;
                continue;
            }
            page_disturbed = false;
        }

        info!("Navigating via '{}' (relevance {})", option.text, option.relevance_score);
        match perform(session, engine, state, option).await? {
            Attempt::Landed(next) => return Ok(Phase::Classifying(next)),
            Attempt::Failed => {
                engine.metrics.record_navigation_failure().await;
                page_disturbed = true;
            }
        }
    }

    warn!("Every navigation option on {} failed", snapshot.url);
    Ok(Phase::Done(TerminationReason::NavigationFailedRepeatedly))
}

/// Open collapsed billing menus and re-read the page if any opened.
///
/// The expanded view only feeds option extraction; it is not a new
/// exploration step.
async fn reveal_menus(
    session: &mut dyn PageSession,
    snapshot: &PageSnapshot,
) -> Result<Option<PageSnapshot>, ScrapeError> {
    let opened = match session.expand_menus().await {
        Ok(0) => return Ok(None),
        Ok(opened) => opened,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            debug!("Could not open menus on {}: {}", snapshot.url, e);
            return Ok(None);
        }
    };

    match session.page_source().await {
        Ok(html) => {
            debug!("Opened {} menu(s) on {}", opened, snapshot.url);
            Ok(Some(PageSnapshot::new(snapshot.id, snapshot.url.clone(), html)))
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("Page unreadable after opening menus on {}: {}", snapshot.url, e);
            Ok(None)
        }
    }
}

/// Carry out one option and capture where it led.
async fn perform(
    session: &mut dyn PageSession,
    engine: &Engine,
    state: &mut ExplorationState,
    option: &NavigationOption,
) -> Result<Attempt, ScrapeError> {
    let timer = engine.metrics.start_timer();
    let action = match (&option.destination, option.is_click()) {
        (Some(destination), false) => session.goto(destination).await,
        _ => session.click(&option.raw_locator).await,
    };
    if let Err(e) = action {
        if e.is_fatal() {
            return Err(e.into());
        }
        warn!("Navigation via '{}' failed: {}", option.text, e);
        return Ok(Attempt::Failed);
    }

    let snapshot = match PageSnapshot::capture(&*session, state.depth + 1, engine.settings.capture_screenshots).await {
        Ok(snapshot) => snapshot,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            warn!("Landed page after '{}' unreadable: {}", option.text, e);
            return Ok(Attempt::Failed);
        }
    };

    if !state.visited.insert(&snapshot.url, snapshot.content_hash()) {
        warn!("'{}' led back to an already visited page ({})", option.text, snapshot.url);
        return Ok(Attempt::Failed);
    }

    state.depth += 1;
    engine.metrics.record_page_load(&snapshot.url, timer.end()).await;
    info!("Landed on {} (page {})", snapshot.url, state.depth);
    Ok(Attempt::Landed(snapshot))
}
