//! Which trajectories the engine keeps.
//!
//! Criteria combine with AND; values inside one list combine with OR. An
//! empty list does not restrict anything.

use std::sync::Arc;

use regex::Regex;

use super::trajectory::Trajectory;

/// Caller-supplied predicate applied after the built-in criteria.
pub type TrajectoryPredicate = Arc<dyn Fn(&Trajectory) -> bool + Send + Sync>;

/// Trajectory filter.
#[derive(Clone, Default)]
pub struct TrajectoryFilter {
    /// Modes of transport (`bus`, `tram`, ...).
    pub mots: Vec<String>,
    /// Tenants.
    pub tenants: Vec<String>,
    /// Route identifiers.
    pub route_identifiers: Vec<String>,
    /// Line names, compared case-insensitively.
    pub line_names: Vec<String>,
    /// Pattern the line name must match.
    pub line_regex: Option<Regex>,
    /// Extra predicate.
    pub predicate: Option<TrajectoryPredicate>,
}

impl std::fmt::Debug for TrajectoryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryFilter")
            .field("mots", &self.mots)
            .field("tenants", &self.tenants)
            .field("route_identifiers", &self.route_identifiers)
            .field("line_names", &self.line_names)
            .field("line_regex", &self.line_regex.as_ref().map(Regex::as_str))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl TrajectoryFilter {
    /// Keep only these modes of transport.
    #[must_use]
    pub fn with_mots<I, S>(mut self, mots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mots = mots.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only these tenants.
    #[must_use]
    pub fn with_tenants<I, S>(mut self, tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tenants = tenants.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only these route identifiers.
    #[must_use]
    pub fn with_route_identifiers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route_identifiers = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only these line names.
    #[must_use]
    pub fn with_line_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.line_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only line names matching `pattern`.
    pub fn with_line_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.line_regex = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Add a custom predicate.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Trajectory) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether the filter lets everything through.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mots.is_empty()
            && self.tenants.is_empty()
            && self.route_identifiers.is_empty()
            && self.line_names.is_empty()
            && self.line_regex.is_none()
            && self.predicate.is_none()
    }

    /// Whether `trajectory` passes.
    #[must_use]
    pub fn matches(&self, trajectory: &Trajectory) -> bool {
        let props = &trajectory.properties;
        let line = trajectory.line_name();

        let exact = |a: &str, b: &str| a == b;
        any_of(&self.mots, props.mot.as_deref(), exact)
            && any_of(&self.tenants, props.tenant.as_deref(), exact)
            && any_of(
                &self.route_identifiers,
                props.route_identifier.as_deref(),
                exact,
            )
            && any_of(&self.line_names, line, |a, b| a.eq_ignore_ascii_case(b))
            && self
                .line_regex
                .as_ref()
                .map_or(true, |re| line.is_some_and(|l| re.is_match(l)))
            && self.predicate.as_ref().map_or(true, |p| p(trajectory))
    }
}

fn any_of(allowed: &[String], value: Option<&str>, eq: impl Fn(&str, &str) -> bool) -> bool {
    if allowed.is_empty() {
        return true;
    }
    value.is_some_and(|v| allowed.iter().any(|a| eq(a, v)))
}
