//! Under-relaxation of coupled fields between Picard iterates

use serde::{Deserialize, Serialize};

/// Under-relaxation policy for one coupled quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RelaxationRepr", into = "RelaxationRepr")]
pub enum Relaxation {
    /// Constant weight on the new iterate, in (0, 1]
    Fixed(f64),

    /// Weight 1/n on the n-th iterate; repeated updates form a running mean
    RobbinsMonro,
}

impl Default for Relaxation {
    fn default() -> Self {
        Relaxation::Fixed(1.0)
    }
}

/// Configuration form: a number or the `robbins-monro` keyword
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RelaxationRepr {
    Coefficient(f64),
    Keyword(String),
}

impl TryFrom<RelaxationRepr> for Relaxation {
    type Error = String;

    fn try_from(repr: RelaxationRepr) -> Result<Self, Self::Error> {
        match repr {
            RelaxationRepr::Coefficient(alpha) => {
                let relaxation = Relaxation::Fixed(alpha);
                relaxation.validate()?;
                Ok(relaxation)
            }
            RelaxationRepr::Keyword(keyword) if keyword == "robbins-monro" => Ok(Relaxation::RobbinsMonro),
            RelaxationRepr::Keyword(keyword) => Err(format!(
                "unknown relaxation '{}', expected a number in (0, 1] or 'robbins-monro'",
                keyword
            )),
        }
    }
}

impl From<Relaxation> for RelaxationRepr {
    fn from(relaxation: Relaxation) -> Self {
        match relaxation {
            Relaxation::Fixed(alpha) => RelaxationRepr::Coefficient(alpha),
            Relaxation::RobbinsMonro => RelaxationRepr::Keyword("robbins-monro".to_string()),
        }
    }
}

impl Relaxation {
    /// Check that a fixed factor lies in (0, 1]
    pub fn validate(self) -> Result<(), String> {
        match self {
            Relaxation::Fixed(alpha) if alpha > 0.0 && alpha <= 1.0 => Ok(()),
            Relaxation::Fixed(alpha) => Err(format!("relaxation factor must lie in (0, 1], got {}", alpha)),
            Relaxation::RobbinsMonro => Ok(()),
        }
    }

    /// Relax `x` against `prev` for the `n`-th Picard iterate (1-based)
    pub fn apply(self, x: f64, prev: f64, n: usize) -> f64 {
        debug_assert!(n >= 1, "Picard iterates are counted from 1");
        match self {
            Relaxation::Fixed(alpha) => alpha * x + (1.0 - alpha) * prev,
            Relaxation::RobbinsMonro => {
                let n = n as f64;
                x / n + (1.0 - 1.0 / n) * prev
            }
        }
    }

    /// Relax every entry of `current` in place
    pub fn relax(self, current: &mut [f64], previous: &[f64], n: usize) {
        debug_assert_eq!(current.len(), previous.len());
        for (x, &prev) in current.iter_mut().zip(previous) {
            *x = self.apply(*x, prev, n);
        }
    }

    /// Relax only the entries whose mask is set; the rest keep their bits
    pub fn relax_masked(self, current: &mut [f64], previous: &[f64], mask: &[bool], n: usize) {
        debug_assert_eq!(current.len(), previous.len());
        debug_assert_eq!(current.len(), mask.len());
        for ((x, &prev), _) in current
            .iter_mut()
            .zip(previous)
            .zip(mask)
            .filter(|(_, masked)| **masked)
        {
            *x = self.apply(*x, prev, n);
        }
    }
}

/// Per-cell values of one coupled quantity plus the previous iterate
///
/// Both vectors are indexed by the global cell list of the owning rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldVector {
    pub current: Vec<f64>,
    pub previous: Vec<f64>,
}

impl FieldVector {
    pub fn zeros(len: usize) -> Self {
        Self {
            current: vec![0.0; len],
            previous: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Copy the current iterate into `previous`
    pub fn store_previous(&mut self) {
        self.previous.clone_from(&self.current);
    }

    pub fn relax(&mut self, relaxation: Relaxation, n: usize) {
        relaxation.relax(&mut self.current, &self.previous, n);
    }

    pub fn relax_masked(&mut self, relaxation: Relaxation, mask: &[bool], n: usize) {
        relaxation.relax_masked(&mut self.current, &self.previous, mask, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_formula() {
        assert_eq!(Relaxation::Fixed(0.5).apply(150.0, 140.0, 1), 145.0);
        assert_eq!(Relaxation::Fixed(0.25).apply(400.0, 0.0, 3), 100.0);
    }

    #[test]
    fn test_robbins_monro_formula() {
        assert_eq!(Relaxation::RobbinsMonro.apply(10.0, 4.0, 2), 7.0);
        assert_eq!(Relaxation::RobbinsMonro.apply(9.0, 6.0, 3), 7.0);
    }

    #[test]
    fn test_validate() {
        assert!(Relaxation::Fixed(1.0).validate().is_ok());
        assert!(Relaxation::Fixed(1e-6).validate().is_ok());
        assert!(Relaxation::RobbinsMonro.validate().is_ok());
        assert!(Relaxation::Fixed(0.0).validate().is_err());
        assert!(Relaxation::Fixed(1.0001).validate().is_err());
        assert!(Relaxation::Fixed(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_parse() {
        let fixed: Relaxation = serde_yaml::from_str("0.3").unwrap();
        assert_eq!(fixed, Relaxation::Fixed(0.3));

        let whole: Relaxation = serde_yaml::from_str("1").unwrap();
        assert_eq!(whole, Relaxation::Fixed(1.0));

        let rm: Relaxation = serde_yaml::from_str("robbins-monro").unwrap();
        assert_eq!(rm, Relaxation::RobbinsMonro);

        assert!(serde_yaml::from_str::<Relaxation>("-0.5").is_err());
        assert!(serde_yaml::from_str::<Relaxation>("aitken").is_err());
    }

    #[test]
    fn test_serialize() {
        assert_eq!(serde_json::to_string(&Relaxation::Fixed(0.5)).unwrap(), "0.5");
        assert_eq!(
            serde_json::to_string(&Relaxation::RobbinsMonro).unwrap(),
            "\"robbins-monro\""
        );
    }

    #[test]
    fn test_relax_masked_leaves_unmasked_bits() {
        let odd = f64::from_bits(0x4059_0000_0000_0001);
        let mut current = vec![200.0, odd, 600.0];
        let previous = vec![100.0, 1.0, 200.0];

        Relaxation::Fixed(0.5).relax_masked(&mut current, &previous, &[true, false, true], 1);

        assert_eq!(current[0], 150.0);
        assert_eq!(current[1].to_bits(), odd.to_bits());
        assert_eq!(current[2], 400.0);
    }

    #[test]
    fn test_field_vector_store_and_relax() {
        let mut field = FieldVector::zeros(2);
        field.current = vec![140.0, 340.0];
        field.store_previous();
        field.current = vec![150.0, 350.0];

        field.relax(Relaxation::Fixed(0.5), 1);

        assert_eq!(field.current, vec![145.0, 345.0]);
        assert_eq!(field.previous, vec![140.0, 340.0]);
    }

    proptest! {
        #[test]
        fn prop_alpha_one_is_identity(x in -1e6f64..1e6, prev in -1e6f64..1e6, n in 1usize..100) {
            prop_assert_eq!(Relaxation::Fixed(1.0).apply(x, prev, n), x);
        }

        #[test]
        fn prop_robbins_monro_first_iterate_is_identity(x in -1e6f64..1e6, prev in -1e6f64..1e6) {
            prop_assert_eq!(Relaxation::RobbinsMonro.apply(x, prev, 1), x);
        }

        #[test]
        fn prop_fixed_stays_between_iterates(x in -1e6f64..1e6, prev in -1e6f64..1e6, alpha in 0.001f64..=1.0) {
            let relaxed = Relaxation::Fixed(alpha).apply(x, prev, 1);
            let (lo, hi) = if x < prev { (x, prev) } else { (prev, x) };
            let slack = 1e-9 * (1.0 + lo.abs().max(hi.abs()));
            prop_assert!(relaxed >= lo - slack && relaxed <= hi + slack);
        }

        #[test]
        fn prop_robbins_monro_is_running_mean(samples in prop::collection::vec(-1e3f64..1e3, 1..40)) {
            let mut mean = 0.0;
            for (i, &x) in samples.iter().enumerate() {
                mean = Relaxation::RobbinsMonro.apply(x, mean, i + 1);
            }
            let expected = samples.iter().sum::<f64>() / samples.len() as f64;
            prop_assert!((mean - expected).abs() <= 1e-9 * (1.0 + expected.abs()) + 1e-9);
        }
    }
}
