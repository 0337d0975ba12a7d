use std::{collections::HashSet, env, fmt, future::Future, sync::Arc, time::Duration};

use super::{context::JobContext, semaphore::ExecutionSemaphore};

tokio::task_local! {
	static CURRENT_LOCALE: Option<Locale>;
	static CURRENT_SUBJECT: Option<Subject>;
}

/// A language tag like `de` or `fr-CH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale(Arc<str>);

impl Locale {
	#[must_use]
	pub fn of(tag: &str) -> Self {
		Self(tag.trim().replace('_', "-").into())
	}

	#[must_use]
	pub fn tag(&self) -> &str {
		&self.0
	}

	/// The locale the process runs with, from `LC_ALL` or `LANG`.
	#[must_use]
	pub fn from_env() -> Option<Self> {
		["LC_ALL", "LANG"]
			.into_iter()
			.filter_map(|var| env::var(var).ok())
			.find_map(|value| {
				let tag = value.split(['.', '@']).next().unwrap_or_default();
				(!tag.is_empty() && tag != "C" && tag != "POSIX").then(|| Self::of(tag))
			})
	}

	/// The locale installed for the current job, falling back to the process locale.
	#[must_use]
	pub fn current() -> Option<Self> {
		CURRENT_LOCALE
			.try_with(Clone::clone)
			.unwrap_or_else(|_| Self::from_env())
	}
}

impl fmt::Display for Locale {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// The security subject a job runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
	name: String,
	principals: Vec<String>,
}

impl Subject {
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			principals: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
		self.principals.push(principal.into());
		self
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn principals(&self) -> &[String] {
		&self.principals
	}

	/// The subject installed for the current job.
	#[must_use]
	pub fn current() -> Option<Self> {
		CURRENT_SUBJECT.try_with(Clone::clone).ok().flatten()
	}
}

/// Describes how a unit of work is to be executed.
///
/// Built with [`JobInput::defaults`], which picks up the ambient subject, locale and
/// [`JobContext`] of the calling job, or with [`JobInput::empty`] which doesn't.
#[derive(Debug, Clone, Default)]
pub struct JobInput {
	id: i64,
	name: Option<String>,
	expiration_time: Option<Duration>,
	subject: Option<Subject>,
	locale: Option<Locale>,
	preferred_locale: bool,
	context: JobContext,
	execution_semaphore: Option<ExecutionSemaphore>,
	execution_hints: HashSet<String>,
}

impl JobInput {
	/// An input without any ambient values, its (unset) locale counts as preferred.
	#[must_use]
	pub fn empty() -> Self {
		Self {
			preferred_locale: true,
			..Self::default()
		}
	}

	/// An input capturing the ambient subject, the ambient locale as a non-preferred value and a
	/// copy of the current [`JobContext`].
	#[must_use]
	pub fn defaults() -> Self {
		Self {
			subject: Subject::current(),
			locale: Locale::current(),
			preferred_locale: false,
			context: JobContext::current(),
			..Self::default()
		}
	}

	#[must_use]
	pub fn with_id(mut self, id: i64) -> Self {
		self.id = id;
		self
	}

	#[must_use]
	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	#[must_use]
	pub fn with_context(mut self, context: JobContext) -> Self {
		self.context = context;
		self
	}

	#[must_use]
	pub fn with_subject(mut self, subject: Option<Subject>) -> Self {
		self.subject = subject;
		self
	}

	/// Sets a preferred locale, same as `with_locale_preference(locale, true)`.
	#[must_use]
	pub fn with_locale(self, locale: Option<Locale>) -> Self {
		self.with_locale_preference(locale, true)
	}

	/// A non-preferred locale never replaces a preferred one.
	#[must_use]
	pub fn with_locale_preference(mut self, locale: Option<Locale>, preferred: bool) -> Self {
		if preferred || !self.preferred_locale {
			self.locale = locale;
			self.preferred_locale = preferred;
		}
		self
	}

	/// The job is cancelled instead of started if it is still waiting for execution once this
	/// much time passed since it was submitted. `None` never expires.
	#[must_use]
	pub fn with_expiration_time(mut self, expiration_time: Option<Duration>) -> Self {
		self.expiration_time = expiration_time;
		self
	}

	/// Jobs of the same semaphore only run while holding one of its permits.
	#[must_use]
	pub fn with_execution_semaphore(mut self, semaphore: Option<ExecutionSemaphore>) -> Self {
		self.execution_semaphore = semaphore;
		self
	}

	/// Tags the future with `hint`, see [`FutureFilter::with_execution_hint`](crate::FutureFilter::with_execution_hint).
	#[must_use]
	pub fn with_execution_hint(mut self, hint: impl Into<String>) -> Self {
		self.execution_hints.insert(hint.into());
		self
	}

	#[must_use]
	pub const fn id(&self) -> i64 {
		self.id
	}

	#[must_use]
	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	#[must_use]
	pub const fn expiration_time(&self) -> Option<Duration> {
		self.expiration_time
	}

	#[must_use]
	pub const fn subject(&self) -> Option<&Subject> {
		self.subject.as_ref()
	}

	#[must_use]
	pub const fn locale(&self) -> Option<&Locale> {
		self.locale.as_ref()
	}

	#[must_use]
	pub const fn is_preferred_locale(&self) -> bool {
		self.preferred_locale
	}

	#[must_use]
	pub const fn context(&self) -> &JobContext {
		&self.context
	}

	#[must_use]
	pub const fn execution_semaphore(&self) -> Option<&ExecutionSemaphore> {
		self.execution_semaphore.as_ref()
	}

	#[must_use]
	pub const fn execution_hints(&self) -> &HashSet<String> {
		&self.execution_hints
	}

	/// `"id;name"` when both are set, otherwise whichever of them is set, or `default`.
	#[must_use]
	pub fn identifier(&self, default: &str) -> String {
		match (self.id, self.name.as_deref().filter(|name| !name.is_empty())) {
			(0, None) => default.to_string(),
			(0, Some(name)) => name.to_string(),
			(id, None) => id.to_string(),
			(id, Some(name)) => format!("{id};{name}"),
		}
	}

	pub(crate) async fn scope<F: Future>(&self, fut: F) -> F::Output {
		CURRENT_SUBJECT
			.scope(
				self.subject.clone(),
				CURRENT_LOCALE.scope(self.locale.clone(), fut),
			)
			.await
	}
}
