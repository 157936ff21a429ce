//! Filter-level invariants: biquad identity, cascade composition, the
//! bilinear transform and the DCA coefficient scaling.

use approx::assert_abs_diff_eq;
use soundfield::biquad::{bilinear, BiQuad, Cascade, LaplaceCoefficients, SosCoefficients};
use soundfield::coefficients::{DcaCoefficients, SourceType};
use soundfield::denormal::{Ac, NoPrevention};

#[test]
fn biquad_identity() {
    // b0 = 1, everything else zero: the filter is the identity and the
    // state stays bounded by the input.
    let mut filter: BiQuad<f64, NoPrevention> = BiQuad::new();
    filter.set(SosCoefficients::identity());
    let input: Vec<f64> = (0..256).map(|i| ((i * 37) % 17) as f64 - 8.0).collect();
    for &x in &input {
        assert_eq!(filter.process(x), x);
    }
}

#[test]
fn cascade_composition() {
    // A cascade of k identical sections equals one section applied k
    // times on the same sample stream.
    let coefficients = SosCoefficients::new(0.9, -0.4, 0.2, -0.5, 0.3);
    let k = 4;

    let mut cascade: Cascade<f64, NoPrevention> = Cascade::new(k);
    cascade.set(std::iter::repeat(coefficients).take(k));

    let mut chain: Vec<BiQuad<f64, NoPrevention>> = (0..k)
        .map(|_| {
            let mut section = BiQuad::new();
            section.set(coefficients);
            section
        })
        .collect();

    for i in 0..512 {
        let x = (i as f64 * 0.1).sin() * 0.7;
        let via_cascade = cascade.process(x);
        let via_chain = chain.iter_mut().fold(x, |acc, s| s.process(acc));
        assert_eq!(via_cascade, via_chain);
    }
}

#[test]
fn cascade_composition_with_denormal_prevention() {
    // With the alternating-offset policy the two variants may differ by
    // the injected offsets only, a few epsilon per sample.
    let coefficients = SosCoefficients::new(0.9, -0.4, 0.2, -0.5, 0.3);
    let mut cascade: Cascade<f64, Ac<f64>> = Cascade::new(2);
    cascade.set(std::iter::repeat(coefficients).take(2));

    let mut a: BiQuad<f64, Ac<f64>> = BiQuad::new();
    a.set(coefficients);
    let mut b: BiQuad<f64, Ac<f64>> = BiQuad::new();
    b.set(coefficients);

    for i in 0..256 {
        let x = (i as f64 * 0.3).cos();
        let via_cascade = cascade.process(x);
        let via_chain = b.process(a.process(x));
        assert_abs_diff_eq!(via_cascade, via_chain, epsilon = 1e-12);
    }
}

#[test]
fn bilinear_zero_prototype_is_identity() {
    let out = bilinear(LaplaceCoefficients::default(), 44100, 1000.0);
    // Numerator and denominator coincide, i.e. the filter passes
    // everything unchanged.
    assert_abs_diff_eq!(out.b0, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out.b1, out.a1, epsilon = 1e-12);
    assert_abs_diff_eq!(out.b2, out.a2, epsilon = 1e-12);

    let mut filter: BiQuad<f64, NoPrevention> = BiQuad::new();
    filter.set(out);
    for i in 0..64 {
        let x = (i as f64 * 0.21).sin();
        assert_abs_diff_eq!(filter.process(x), x, epsilon = 1e-9);
    }
}

#[test]
fn coefficient_scaling_at_the_array_radius() {
    // A point source on the array radius gets the same scaling for
    // numerator and denominator, so every section is flat; the
    // denominator is shared with the plane-wave variant.
    for mode in 0..=8usize {
        let mut point = DcaCoefficients::new(mode, 44100, 1.7, 343.0).unwrap();
        point.reset(1.7, SourceType::PointSource);
        let mut plane = DcaCoefficients::new(mode, 44100, 1.7, 343.0).unwrap();
        plane.reset(1.7, SourceType::PlaneWave);

        for (p, q) in point.sections().iter().zip(plane.sections()) {
            assert_abs_diff_eq!(p.b0, 1.0, epsilon = 1e-9);
            assert_abs_diff_eq!(p.b1, p.a1, epsilon = 1e-9);
            assert_abs_diff_eq!(p.b2, p.a2, epsilon = 1e-9);
            assert_abs_diff_eq!(p.a1, q.a1, epsilon = 1e-9);
            assert_abs_diff_eq!(p.a2, q.a2, epsilon = 1e-9);
        }
    }
}

#[test]
fn dca_filters_are_stable() {
    // Feed an impulse through every mode filter of a realistic setup and
    // let it ring: the response must decay, not blow up.
    for mode in 0..=6usize {
        let mut coefficients = DcaCoefficients::new(mode, 44100, 1.5, 343.0).unwrap();
        coefficients.reset(3.0, SourceType::PointSource);
        let mut cascade: Cascade<f64, Ac<f64>> = Cascade::new(coefficients.len());
        cascade.set(coefficients.sections().iter().copied());

        let mut peak_early: f64 = 0.0;
        let mut peak_late: f64 = 0.0;
        for i in 0..8192 {
            let x = if i == 0 { 1.0 } else { 0.0 };
            let y = cascade.process(x).abs();
            assert!(y.is_finite());
            if i < 4096 {
                peak_early = peak_early.max(y);
            } else {
                peak_late = peak_late.max(y);
            }
        }
        assert!(
            peak_late < peak_early,
            "mode {mode}: {peak_late} !< {peak_early}"
        );
    }
}

#[test]
fn denormal_prevention_keeps_states_out_of_the_denormal_range() {
    // A resonant section fed silence decays far enough to cross the
    // denormal range; the alternating offset keeps the output away
    // from it.
    let mut filter: BiQuad<f64, Ac<f64>> = BiQuad::new();
    filter.set(SosCoefficients::new(1.0, 0.0, 0.0, -1.98, 0.9801));
    filter.process(1.0);
    for _ in 0..200_000 {
        let y = filter.process(0.0);
        assert!(y == 0.0 || y.abs() >= f64::MIN_POSITIVE);
    }
}
