//! Attempt plans: which model and temperature each retry uses

/// Parameters for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub model: String,
    /// `None` leaves the upstream default temperature in place.
    pub temperature: Option<f32>,
}

impl Attempt {
    pub fn new(model: impl Into<String>, temperature: Option<f32>) -> Self {
        Self {
            model: model.into(),
            temperature,
        }
    }
}

/// Ordered attempts for one logical request. Its length is the retry budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptPlan {
    attempts: Vec<Attempt>,
}

impl AttemptPlan {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self { attempts }
    }

    /// `count` identical attempts on `model` at the upstream default temperature.
    pub fn repeated(model: &str, count: usize) -> Self {
        Self::new(vec![Attempt::new(model, None); count])
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Attempt> {
        self.attempts.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter()
    }
}

impl FromIterator<Attempt> for AttemptPlan {
    fn from_iter<I: IntoIterator<Item = Attempt>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
