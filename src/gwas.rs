//! Single-variant association test evaluated under encryption.
//!
//! With `x = Σg, y = Σp, a = Σg², b = Σgp, c = Σp²` over `n` individuals, the ratio
//! `P / Q` of the two integer polynomials below equals `t² · n / (n - 2)` for the
//! slope of the least-squares regression of phenotype on genotype.
//!
//! [`evaluate_threshold`] answers only whether a variant passes a p-value threshold: with
//! `Sxx = na - x², Syy = nc - y², Sxy = nb - xy` it returns the encrypted truth of
//! `t² > num / den`, i.e. `(den (n - 2) + num) Sxy² - num Sxx Syy > 0`.

use std::time::Instant;

use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info};

use crate::arith::{divide, BigValueCiphertext, Int72Ciphertext, Quotient, INT72_BITS};
use crate::error::{Error, Result};
use crate::gates::{BinaryGates, BitDecryptor};

/// Largest genotype value (two alternate alleles).
pub const GENOTYPE_BOUND: u128 = 2;

/// Population sums every term of the statistic is built from.
#[derive(Clone, Debug)]
pub struct Sums<B> {
    pub x: BigValueCiphertext<B>,
    pub y: BigValueCiphertext<B>,
    pub a: BigValueCiphertext<B>,
    pub b: BigValueCiphertext<B>,
    pub c: BigValueCiphertext<B>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GwasCiphertext<B> {
    pub population: usize,
    pub statistic: Quotient<B>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GwasOutcome {
    /// `t² · n / (n - 2)`
    pub statistic: f64,
    pub p_value: f64,
}

fn check_population(genotypes: usize, phenotypes: usize) -> Result<()> {
    if genotypes != phenotypes {
        return Err(Error::InvalidInput(format!(
            "{genotypes} genotypes but {phenotypes} phenotypes"
        )));
    }
    if genotypes < 3 {
        return Err(Error::InvalidInput(format!(
            "population of {genotypes} is too small for a regression test"
        )));
    }
    Ok(())
}

/// Per-individual products followed by the population sums, accumulated in input order.
pub fn accumulate<G: BinaryGates>(
    g: &G,
    genotypes: &[BigValueCiphertext<G::Bit>],
    phenotypes: &[BigValueCiphertext<G::Bit>],
) -> Sums<G::Bit> {
    let products = genotypes
        .par_iter()
        .zip(phenotypes.par_iter())
        .map(|(gt, ph)| (gt.mul(gt, g), gt.mul(ph, g), ph.mul(ph, g)))
        .collect::<Vec<_>>();

    let mut sums = Sums {
        x: BigValueCiphertext::zero(g),
        y: BigValueCiphertext::zero(g),
        a: BigValueCiphertext::zero(g),
        b: BigValueCiphertext::zero(g),
        c: BigValueCiphertext::zero(g),
    };
    for ((gt, ph), (g2, gp, p2)) in genotypes.iter().zip(phenotypes).zip(&products) {
        sums.x = sums.x.add(gt, g);
        sums.y = sums.y.add(ph, g);
        sums.a = sums.a.add(g2, g);
        sums.b = sums.b.add(gp, g);
        sums.c = sums.c.add(p2, g);
    }
    sums
}

/// Numerator and denominator of the statistic as 72-bit integers.
pub fn ratio<G: BinaryGates>(
    g: &G,
    sums: &Sums<G::Bit>,
    n: usize,
) -> Result<(Int72Ciphertext<G::Bit>, Int72Ciphertext<G::Bit>)> {
    let Sums { x, y, a, b, c } = sums;

    let ab = a.mul(b, g);
    let ab2 = ab.mul(b, g);
    let ay = a.mul(y, g);
    let a2y2 = ay.mul(&ay, g);
    let bx = b.mul(x, g);
    let b2x2 = bx.mul(&bx, g);
    let abxy = ay.mul(&bx, g);
    let x2 = x.mul(x, g);
    let x2y = x2.mul(y, g);
    let x4y2 = x2y.mul(&x2y, g);
    let ax2y2 = ay.mul(&x2y, g);
    let bx3y = bx.mul(&x2y, g);
    let ac = a.mul(c, g);
    let a2c = a.mul(&ac, g);
    let acx2 = ac.mul(&x2, g);
    let cx2 = c.mul(&x2, g);
    let cx4 = cx2.mul(&x2, g);

    let n = n as i128;
    let numerator_terms = [
        (n * n * n, &ab2),
        (-2 * n * n, &abxy),
        (n, &ax2y2),
        (-n * n, &b2x2),
        (2 * n, &bx3y),
        (-1, &x4y2),
    ];
    let denominator_terms = [
        (n, &b2x2),
        (-n, &a2y2),
        (-n * n, &ab2),
        (1, &ax2y2),
        (n * n, &a2c),
        (-2 * n, &acx2),
        (1, &cx4),
        (2 * n, &abxy),
        (-2, &bx3y),
    ];

    Ok((
        combine(g, &numerator_terms[..])?,
        combine(g, &denominator_terms[..])?,
    ))
}

/// `Σ coefficient * value` modulo 2^72.
fn combine<G: BinaryGates>(
    g: &G,
    terms: &[(i128, &BigValueCiphertext<G::Bit>)],
) -> Result<Int72Ciphertext<G::Bit>> {
    terms
        .iter()
        .try_fold(Int72Ciphertext::zero(g), |acc, (coefficient, value)| {
            // a term whose bound does not fit 72 bits would silently wrap
            if value.bits().len() > INT72_BITS {
                return Err(Error::Overflow {
                    bound: value.upper_bound(),
                });
            }
            Ok(Int72Ciphertext::scaled_accumulate(g, *coefficient, value, &acc))
        })
}

/// Denominator of the `t²` threshold fraction.
pub const THRESHOLD_SCALE: u64 = 16;

/// `t²` at which the two-sided p-value (2 degrees of freedom) equals `p_threshold`,
/// rounded to the nearest multiple of `1 / THRESHOLD_SCALE`. Returns `(num, den)`.
pub fn threshold_ratio(p_threshold: f64) -> Result<(u64, u64)> {
    if !(p_threshold > 0.0 && p_threshold < 1.0) {
        return Err(Error::InvalidInput(format!(
            "p-value threshold {p_threshold} outside (0, 1)"
        )));
    }
    let dist = StudentsT::new(0.0, 1.0, 2.0)
        .map_err(|e| Error::InvalidInput(format!("student's t: {e}")))?;
    let t = dist.inverse_cdf(1.0 - p_threshold / 2.0);
    let num = (t * t * THRESHOLD_SCALE as f64).round();
    if !num.is_finite() || num >= u64::MAX as f64 {
        return Err(Error::InvalidInput(format!(
            "p-value threshold {p_threshold} is too small"
        )));
    }
    Ok((num as u64, THRESHOLD_SCALE))
}

/// Largest magnitude of the threshold comparison for `n` individuals with phenotypes
/// up to `phenotype_bound`, `None` if it does not even fit 128 bits.
fn threshold_bound(n: u128, phenotype_bound: u128, num: u128, den: u128) -> Option<u128> {
    // Sxx <= n², Syy <= n² B² / 4 and Sxy² <= Sxx Syy
    let cross = n.checked_pow(4)?.checked_mul(phenotype_bound.checked_pow(2)?)? / 4;
    let weight = den
        .checked_mul(n - 2)?
        .checked_add(num.checked_mul(2)?)?;
    weight.checked_mul(cross)
}

/// Encrypted bit set when the variant's p-value is below `p_threshold`. Nothing but that
/// bit leaves the evaluation. A population without variation never passes.
pub fn evaluate_threshold<G: BinaryGates>(
    g: &G,
    genotypes: &[BigValueCiphertext<G::Bit>],
    phenotypes: &[BigValueCiphertext<G::Bit>],
    p_threshold: f64,
) -> Result<G::Bit> {
    check_population(genotypes.len(), phenotypes.len())?;
    let n = genotypes.len();
    let (num, den) = threshold_ratio(p_threshold)?;
    let phenotype_bound = phenotypes
        .iter()
        .map(|p| p.upper_bound())
        .max()
        .unwrap_or(0);
    match threshold_bound(n as u128, phenotype_bound, num as u128, den as u128) {
        Some(bound) if bound < 1 << (INT72_BITS - 1) => {}
        bound => {
            return Err(Error::Overflow {
                bound: bound.unwrap_or(u128::MAX),
            })
        }
    }

    let now = Instant::now();
    let Sums { x, y, a, b, c } = accumulate(g, genotypes, phenotypes);
    debug!(population = n, elapsed = ?now.elapsed(), "population sums");

    let b2 = b.mul(&b, g);
    let xy = x.mul(&y, g);
    let bxy = b.mul(&xy, g);
    let x2y2 = xy.mul(&xy, g);
    let ac = a.mul(&c, g);
    let ay2 = a.mul(&y.mul(&y, g), g);
    let cx2 = c.mul(&x.mul(&x, g), g);

    let (n, num, den) = (n as i128, num as i128, den as i128);
    let weight = den * (n - 2) + num;
    let terms = [
        (weight * n * n, &b2),
        (-2 * weight * n, &bxy),
        (den * (n - 2), &x2y2),
        (-num * n * n, &ac),
        (num * n, &ay2),
        (num * n, &cx2),
    ];
    let difference = combine(g, &terms[..])?;

    let bits = difference.bits();
    let non_negative = g.not(&bits[INT72_BITS - 1]);
    let significant = g.and(&non_negative, &g.or_all(bits));
    info!(population = n, p_threshold, elapsed = ?now.elapsed(), "gwas threshold evaluated");
    Ok(significant)
}

/// Encrypted statistic for one variant. Runs on the current rayon pool.
pub fn evaluate<G: BinaryGates>(
    g: &G,
    genotypes: &[BigValueCiphertext<G::Bit>],
    phenotypes: &[BigValueCiphertext<G::Bit>],
) -> Result<GwasCiphertext<G::Bit>> {
    check_population(genotypes.len(), phenotypes.len())?;
    let n = genotypes.len();

    let now = Instant::now();
    let sums = accumulate(g, genotypes, phenotypes);
    debug!(population = n, elapsed = ?now.elapsed(), "population sums");

    let now = Instant::now();
    let (numerator, denominator) = ratio(g, &sums, n)?;
    debug!(elapsed = ?now.elapsed(), "numerator and denominator");

    let now = Instant::now();
    let statistic = divide(g, &numerator, &denominator)?;
    info!(population = n, elapsed = ?now.elapsed(), "gwas statistic divided");

    Ok(GwasCiphertext {
        population: n,
        statistic,
    })
}

/// Two-sided p-value of the statistic, Student's t with two degrees of freedom.
pub fn p_value(statistic: f64, n: usize) -> Result<f64> {
    if n < 3 {
        return Err(Error::InvalidInput(format!(
            "population of {n} is too small for a regression test"
        )));
    }
    let t = (statistic * (n - 2) as f64 / n as f64).max(0.0).sqrt();
    let dist = StudentsT::new(0.0, 1.0, 2.0)
        .map_err(|e| Error::InvalidInput(format!("student's t: {e}")))?;
    Ok(2.0 * (1.0 - dist.cdf(t)))
}

pub fn decrypt<D: BitDecryptor>(
    decryptor: &D,
    ciphertext: &GwasCiphertext<D::Bit>,
) -> Result<GwasOutcome>
where
    D::Bit: Clone,
{
    let statistic = ciphertext.statistic.decrypt(decryptor);
    Ok(GwasOutcome {
        statistic,
        p_value: p_value(statistic, ciphertext.population)?,
    })
}

/// Exact numerator and denominator over clear values.
pub fn reference_ratio(genotypes: &[u8], phenotypes: &[u64]) -> Result<(i128, i128)> {
    check_population(genotypes.len(), phenotypes.len())?;
    let n = genotypes.len() as i128;
    let (mut x, mut y, mut a, mut b, mut c) = (0i128, 0i128, 0i128, 0i128, 0i128);
    for (gt, ph) in genotypes.iter().zip(phenotypes) {
        let (gt, ph) = (*gt as i128, *ph as i128);
        x += gt;
        y += ph;
        a += gt * gt;
        b += gt * ph;
        c += ph * ph;
    }
    let (ab2, abxy) = (a * b * b, a * b * x * y);
    let (ax2y2, b2x2) = (a * x * x * y * y, b * b * x * x);
    let (bx3y, x4y2) = (b * x * x * x * y, x * x * x * x * y * y);

    let numerator = n * n * n * ab2 - 2 * n * n * abxy + n * ax2y2 - n * n * b2x2
        + 2 * n * bx3y
        - x4y2;
    let denominator = n * b2x2 - n * a * a * y * y - n * n * ab2 + ax2y2 + n * n * a * a * c
        - 2 * n * a * c * x * x
        + c * x * x * x * x
        + 2 * n * abxy
        - 2 * bx3y;
    Ok((numerator, denominator))
}

/// Clear counterpart of [`evaluate_threshold`], exact in integers.
pub fn reference_threshold(genotypes: &[u8], phenotypes: &[u64], p_threshold: f64) -> Result<bool> {
    check_population(genotypes.len(), phenotypes.len())?;
    let (num, den) = threshold_ratio(p_threshold)?;
    let n = genotypes.len() as i128;
    let (mut x, mut y, mut a, mut b, mut c) = (0i128, 0i128, 0i128, 0i128, 0i128);
    for (gt, ph) in genotypes.iter().zip(phenotypes) {
        let (gt, ph) = (*gt as i128, *ph as i128);
        x += gt;
        y += ph;
        a += gt * gt;
        b += gt * ph;
        c += ph * ph;
    }
    let (sxx, syy, sxy) = (n * a - x * x, n * c - y * y, n * b - x * y);
    let (num, den) = (num as i128, den as i128);
    Ok((den * (n - 2) + num) * sxy * sxy - num * sxx * syy > 0)
}

/// Clear statistic, `None` when the denominator vanishes (no variation in the data).
pub fn reference_statistic(genotypes: &[u8], phenotypes: &[u64]) -> Result<Option<f64>> {
    let (numerator, denominator) = reference_ratio(genotypes, phenotypes)?;
    Ok((denominator != 0).then(|| numerator as f64 / denominator as f64))
}

/// `t² · n / (n - 2)` from an ordinary least-squares fit.
pub fn regression_statistic(genotypes: &[u8], phenotypes: &[u64]) -> Result<Option<f64>> {
    check_population(genotypes.len(), phenotypes.len())?;
    let n = genotypes.len() as f64;
    let gs = genotypes.iter().map(|v| *v as f64).collect_vec();
    let ps = phenotypes.iter().map(|v| *v as f64).collect_vec();
    let (mean_g, mean_p) = (gs.iter().sum::<f64>() / n, ps.iter().sum::<f64>() / n);

    let sxx: f64 = gs.iter().map(|v| (v - mean_g).powi(2)).sum();
    let sxy: f64 = gs
        .iter()
        .zip(&ps)
        .map(|(g, p)| (g - mean_g) * (p - mean_p))
        .sum();
    if sxx == 0.0 {
        return Ok(None);
    }
    let slope = sxy / sxx;
    let intercept = mean_p - slope * mean_g;
    let rss: f64 = gs
        .iter()
        .zip(&ps)
        .map(|(g, p)| (p - intercept - slope * g).powi(2))
        .sum();
    if rss == 0.0 {
        return Ok(None);
    }
    let t2 = slope * slope * sxx * (n - 2.0) / rss;
    Ok(Some(t2 * n / (n - 2.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::PlainGates;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaChaRng;

    fn population(rng: &mut ChaChaRng, n: usize) -> (Vec<u8>, Vec<u64>) {
        loop {
            let genotypes = (0..n).map(|_| rng.gen_range(0..=2u8)).collect_vec();
            let phenotypes = (0..n).map(|_| rng.gen_range(0..=1u64)).collect_vec();
            if let Ok(Some(_)) = reference_statistic(&genotypes, &phenotypes) {
                return (genotypes, phenotypes);
            }
        }
    }

    fn encrypt(
        genotypes: &[u8],
        phenotypes: &[u64],
    ) -> (Vec<BigValueCiphertext<bool>>, Vec<BigValueCiphertext<bool>>) {
        let g = PlainGates;
        (
            genotypes
                .iter()
                .map(|v| BigValueCiphertext::encrypt(&g, *v as u128, GENOTYPE_BOUND).unwrap())
                .collect_vec(),
            phenotypes
                .iter()
                .map(|v| BigValueCiphertext::encrypt(&g, *v as u128, 1).unwrap())
                .collect_vec(),
        )
    }

    #[test]
    fn test_closed_form_matches_regression() {
        let mut rng = ChaChaRng::seed_from_u64(41);
        for n in [3, 10, 57, 2504] {
            let (genotypes, phenotypes) = population(&mut rng, n);
            let closed = reference_statistic(&genotypes, &phenotypes).unwrap().unwrap();
            if let Some(direct) = regression_statistic(&genotypes, &phenotypes).unwrap() {
                assert!((closed - direct).abs() <= 1e-9 * direct.abs().max(1.0));
            }
            let (numerator, denominator) = reference_ratio(&genotypes, &phenotypes).unwrap();
            assert!(numerator >= 0 && denominator > 0);
        }
    }

    #[test]
    fn test_encrypted_ratio_is_exact() {
        let g = PlainGates;
        let mut rng = ChaChaRng::seed_from_u64(42);
        for n in [3, 10, 200] {
            let (genotypes, phenotypes) = population(&mut rng, n);
            let (gt, ph) = encrypt(&genotypes, &phenotypes);
            let sums = accumulate(&g, &gt, &ph);
            assert_eq!(
                sums.x.decrypt(&g),
                genotypes.iter().map(|v| *v as u128).sum::<u128>()
            );
            let (numerator, denominator) = ratio(&g, &sums, n).unwrap();
            assert_eq!(
                (numerator.decrypt(&g), denominator.decrypt(&g)),
                reference_ratio(&genotypes, &phenotypes).unwrap()
            );
        }
    }

    #[test]
    fn test_evaluate_matches_reference() {
        let g = PlainGates;
        let mut rng = ChaChaRng::seed_from_u64(43);
        for n in [3, 10, 2504] {
            let (genotypes, phenotypes) = population(&mut rng, n);
            let (gt, ph) = encrypt(&genotypes, &phenotypes);
            let outcome = decrypt(&g, &evaluate(&g, &gt, &ph).unwrap()).unwrap();
            let expected = reference_statistic(&genotypes, &phenotypes).unwrap().unwrap();
            if expected == 0.0 {
                assert_eq!(outcome.statistic, 0.0);
            } else {
                assert!(((outcome.statistic - expected) / expected).abs() < 2f64.powi(-15));
            }
            let expected_p = p_value(expected, n).unwrap();
            assert!((outcome.p_value - expected_p).abs() < 1e-3);
        }
    }

    #[test]
    fn test_threshold_ratio() {
        // t² = 2 (1 - p)² / (1 - (1 - p)²) with two degrees of freedom
        assert_eq!(threshold_ratio(0.05).unwrap(), (296, THRESHOLD_SCALE));
        assert_eq!(threshold_ratio(0.5).unwrap(), (11, THRESHOLD_SCALE));
        assert!(threshold_ratio(0.0).is_err());
        assert!(threshold_ratio(1.0).is_err());
        assert!(threshold_ratio(f64::NAN).is_err());
    }

    #[test]
    fn test_reference_threshold_agrees_with_p_value() {
        let mut rng = ChaChaRng::seed_from_u64(44);
        for n in [3, 10, 57, 2504] {
            for _ in 0..5 {
                let (genotypes, phenotypes) = population(&mut rng, n);
                let statistic = reference_statistic(&genotypes, &phenotypes).unwrap().unwrap();
                let p = p_value(statistic, n).unwrap();
                for threshold in [0.5, 0.2, 0.05] {
                    // the threshold's t² is rounded to 1/16, skip values that close to it
                    let (num, den) = threshold_ratio(threshold).unwrap();
                    let t2 = statistic * (n - 2) as f64 / n as f64;
                    if (t2 - num as f64 / den as f64).abs() < 1.0 / den as f64 {
                        continue;
                    }
                    assert_eq!(
                        reference_threshold(&genotypes, &phenotypes, threshold).unwrap(),
                        p < threshold,
                        "n {n}, p {p}, threshold {threshold}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_evaluate_threshold_matches_reference() {
        let g = PlainGates;
        let mut rng = ChaChaRng::seed_from_u64(45);
        for n in [3, 10, 2504] {
            let (mut genotypes, phenotypes) = population(&mut rng, n);
            let (gt, ph) = encrypt(&genotypes, &phenotypes);
            for threshold in [0.9, 0.5, 0.05, 1e-4] {
                let bit = evaluate_threshold(&g, &gt, &ph, threshold).unwrap();
                assert_eq!(
                    bit,
                    reference_threshold(&genotypes, &phenotypes, threshold).unwrap(),
                    "n {n}, threshold {threshold}"
                );
            }

            // a genotype that tracks the phenotype exactly passes any threshold
            for (gt, ph) in genotypes.iter_mut().zip(&phenotypes) {
                *gt = 2 * *ph as u8;
            }
            let (gt, ph) = encrypt(&genotypes, &phenotypes);
            assert!(evaluate_threshold(&g, &gt, &ph, 1e-4).unwrap());
        }
    }

    #[test]
    fn test_threshold_without_variation_fails() {
        let g = PlainGates;
        let (gt, ph) = encrypt(&[1; 10], &[0, 1, 1, 0, 1, 0, 0, 1, 1, 1]);
        assert!(!evaluate_threshold(&g, &gt, &ph, 0.9).unwrap());
        assert!(!reference_threshold(&[1; 10], &[0, 1, 1, 0, 1, 0, 0, 1, 1, 1], 0.9).unwrap());
    }

    #[test]
    fn test_threshold_overflow_rejected() {
        let g = PlainGates;
        let (gt, ph) = encrypt(&[0, 1, 2], &[1, 0, 1]);
        assert!(evaluate_threshold(&g, &gt, &ph, 0.0).is_err());
        let mut rng = ChaChaRng::seed_from_u64(46);
        let (genotypes, phenotypes) = population(&mut rng, 2504);
        let (gt, ph) = encrypt(&genotypes, &phenotypes);
        assert!(matches!(
            evaluate_threshold(&g, &gt, &ph, 1e-12),
            Err(Error::Overflow { .. })
        ));
    }

    #[test]
    fn test_p_value() {
        assert!((p_value(0.0, 10).unwrap() - 1.0).abs() < 1e-12);
        // t = 2 with df = 2: two-sided p = 1 - 2 / sqrt(6)
        let statistic = 4.0 * 10.0 / 8.0;
        let expected = 1.0 - 2.0 / 6f64.sqrt();
        assert!((p_value(statistic, 10).unwrap() - expected).abs() < 1e-9);
        assert!(p_value(1.0, 2).is_err());
    }

    #[test]
    fn test_rejects_bad_population() {
        let g = PlainGates;
        let (gt, ph) = encrypt(&[0, 1, 2], &[1, 0]);
        assert!(evaluate(&g, &gt, &ph).is_err());
        let (gt, ph) = encrypt(&[0, 1], &[1, 0]);
        assert!(matches!(
            evaluate(&g, &gt, &ph),
            Err(Error::InvalidInput(_))
        ));
    }
}
