//! Session-level checks on synthetic maps.

use approx::assert_relative_eq;
use gf_core::{Error, Result, SharedParameters, Tunable};
use gf_likelihood::{
    BackgroundModel, InternalModel, LikeSession, PolynomialSurface, SessionConfig, poisson_log_likelihood,
};
use gf_response::{
    DecBandSpec, DetectorResponse, DetectorResponseSpec, ExtendedSource, LogLogSpectrum, Morphology, PointSource,
    Psf, ResponseBinSpec, SourceCatalog, SourceCatalogSpec, SourceModel,
};
use gf_sky::{BinList, BinMaps, Healpix, Roi, SkyBox, SkyMap, SkyMapCollection, SkyPos};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Poisson;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const CRAB: (f64, f64) = (83.63, 22.01);
const BACKGROUND: f64 = 1000.0;

fn response() -> DetectorResponse {
    let bins = BTreeMap::from([
        (
            "1".to_string(),
            ResponseBinSpec { signal: vec![8.0, 6.0, 4.0, 2.0], background: BACKGROUND, psf: Psf::gaussian(0.5) },
        ),
        (
            "2".to_string(),
            ResponseBinSpec { signal: vec![1.0, 2.0, 3.0, 4.0], background: 100.0, psf: Psf::gaussian(0.3) },
        ),
    ]);
    DetectorResponse::from_spec(&DetectorResponseSpec {
        simulated_spectrum: LogLogSpectrum::default(),
        log_energy_bins: vec![-0.5, 0.0, 0.5, 1.0],
        dec_bands: vec![DecBandSpec { lower: -30.0, upper: 60.0, sim_dec: 20.0, bins }],
    })
    .unwrap()
}

fn crab() -> SkyPos {
    SkyPos::new(CRAB.0, CRAB.1)
}

fn point_catalog() -> Arc<SourceCatalog> {
    Arc::new(
        SourceCatalog::new(SourceCatalogSpec {
            point_sources: vec![PointSource {
                name: "crab".into(),
                ra: CRAB.0,
                dec: CRAB.1,
                spectrum: LogLogSpectrum::default(),
            }],
            extended_sources: vec![],
        })
        .unwrap(),
    )
}

fn empty_catalog() -> Arc<SourceCatalog> {
    Arc::new(SourceCatalog::new(SourceCatalogSpec::default()).unwrap())
}

/// Bin "1" with maps over a disc around the Crab.
fn maps(nside: u32, radius: f64, on: impl Fn(usize) -> f64, background: impl Fn(usize) -> f64) -> SkyMapCollection {
    let hp = Healpix::new(nside).unwrap();
    let pixels = hp.query_disc(&crab(), radius);
    let on = SkyMap::from_pairs(hp, pixels.iter().map(|p| (p, on(p)))).unwrap();
    let bg = SkyMap::from_pairs(hp, pixels.iter().map(|p| (p, background(p)))).unwrap();
    let mut maps = SkyMapCollection::new(1.0).unwrap();
    maps.insert("1", BinMaps::new(on, bg).unwrap()).unwrap();
    maps
}

fn fixed_roi(radius: f64) -> SessionConfig {
    SessionConfig { fixed_roi: Some(Roi::disc(&crab(), radius)), ..SessionConfig::default() }
}

fn session(
    maps: &SkyMapCollection,
    model: Arc<dyn SourceModel>,
    internal: InternalModel,
    config: SessionConfig,
) -> LikeSession {
    let bins = BinList::from_names(["1"]).unwrap();
    LikeSession::new(response(), maps, &bins, model, internal, config).unwrap()
}

/// On-counts equal to background plus the model's own expected excess.
fn asimov_maps(nside: u32) -> SkyMapCollection {
    let flat = maps(nside, 6.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut s = session(&flat, point_catalog(), InternalModel::default(), fixed_roi(3.0));
    let excess = s.expected_excess_maps().unwrap().remove(0);
    maps(nside, 6.0, |p| BACKGROUND + excess.get(p).copied().unwrap_or(0.0), |_| BACKGROUND)
}

#[test]
fn test_asimov_ts_matches_gaussian_approximation() {
    let maps = asimov_maps(64);
    let mut s = session(&maps, point_catalog(), InternalModel::new(true, false), fixed_roi(3.0));
    let excess = s.expected_excess_maps().unwrap().remove(0);
    let gaussian: f64 = excess.iter().map(|(_, v)| v * v / BACKGROUND).sum();
    let exact: f64 = excess.iter().map(|(_, v)| 2.0 * ((BACKGROUND + v) * (v / BACKGROUND).ln_1p() - v)).sum();
    assert!(gaussian > 0.05, "signal too weak for the test: {gaussian}");

    s.set_common_norm(0.5);
    let ts = s.calc_test_statistic(true).unwrap();
    assert_relative_eq!(ts.ts, gaussian, max_relative = 0.01);
    assert_relative_eq!(ts.ts, exact, max_relative = 1e-3);
    assert_relative_eq!(ts.common_norm, 1.0, epsilon = 0.05);
    assert!(ts.background_fit.is_none());
    let model_fit = ts.model_fit.as_ref().unwrap();
    assert_eq!(model_fit.fit.names, vec!["common_norm".to_string()]);
    assert_relative_eq!(ts.significance(), ts.ts.sqrt(), max_relative = 1e-12);
}

#[test]
fn test_asimov_weights_estimate() {
    let maps = asimov_maps(64);
    let mut s = session(&maps, point_catalog(), InternalModel::default(), fixed_roi(3.0));
    let excess = s.expected_excess_maps().unwrap().remove(0);
    let fisher: f64 = excess.iter().map(|(_, v)| v * v / BACKGROUND).sum();

    s.set_common_norm(3.0);
    let est = s.estimate_norm_and_sigma().unwrap();
    assert_eq!(s.common_norm(), 1.0);
    assert_relative_eq!(est.norm, 1.0, max_relative = 1e-9);
    assert_relative_eq!(est.sigma, fisher.sqrt(), max_relative = 1e-9);
}

#[test]
fn test_asimov_top_hat() {
    let maps = asimov_maps(64);
    let mut s = session(&maps, point_catalog(), InternalModel::new(true, false), fixed_roi(3.0));
    let radii = [2.0];
    let signal = s.top_hat_expected_excesses(&crab(), 2.0).unwrap()[0];
    let background = s.top_hat_backgrounds(&crab(), 2.0).unwrap()[0];
    let area = s.top_hat_areas(&crab(), 2.0).unwrap()[0];
    let n_pixels = Healpix::new(64).unwrap().query_disc(&crab(), 2.0).len() as f64;
    assert_relative_eq!(background, BACKGROUND * n_pixels, max_relative = 1e-12);
    assert_relative_eq!(area, n_pixels * Healpix::new(64).unwrap().pixel_area_deg2(), max_relative = 1e-12);
    assert_relative_eq!(s.top_hat_excesses(&crab(), 2.0).unwrap()[0], signal, max_relative = 1e-9);

    s.set_common_norm(0.5);
    let ts = s.calc_top_hat_test_statistic(&crab(), &radii, true).unwrap();
    assert_relative_eq!(ts.ts, signal * signal / background, max_relative = 0.01);

    let est = s.estimate_top_hat_norm_and_sigma(&crab(), &radii).unwrap();
    assert_relative_eq!(est.norm, 1.0, max_relative = 1e-9);

    let err = s.calc_top_hat_test_statistic(&crab(), &[2.0, 1.0], true).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_zero_signal_equals_background_likelihood() {
    let maps = maps(64, 6.0, |p| 900.0 + (p % 7) as f64 * 40.0, |_| BACKGROUND);
    let mut s = session(&maps, point_catalog(), InternalModel::default(), fixed_roi(3.0));
    s.set_common_norm(0.0);
    let model = s.calc_log_likelihood(false).unwrap();
    let background = s.calc_background_log_likelihood(false).unwrap();
    assert_eq!(model.log_likelihood, background.log_likelihood);
    assert!(model.fit.is_none());
    assert!(model.converged());

    s.set_common_norm(1.0);
    let ts = s.calc_test_statistic(false).unwrap();
    assert_ne!(ts.ts, 0.0);
}

#[test]
fn test_ts_never_negative_on_poisson_maps() {
    let hp = Healpix::new(64).unwrap();
    let pixels = hp.query_disc(&crab(), 6.0);
    let poisson = Poisson::new(50.0).unwrap();
    for seed in 0..6u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let counts: Vec<(usize, f64)> = pixels.iter().map(|p| (p, rng.sample(poisson))).collect();
        let on = SkyMap::from_pairs(hp, counts).unwrap();
        let bg = SkyMap::new(hp, pixels.clone(), 50.0);
        let mut maps = SkyMapCollection::new(1.0).unwrap();
        maps.insert("1", BinMaps::new(on, bg).unwrap()).unwrap();

        let mut s = session(&maps, point_catalog(), InternalModel::new(true, false), fixed_roi(3.0));
        let ts = s.calc_test_statistic(true).unwrap();
        assert!(ts.ts.is_finite());
        assert!(ts.ts >= 0.0, "seed {seed}: TS {}", ts.ts);
        assert!(ts.common_norm >= 0.0);
    }
}

#[test]
fn test_background_norm_fit() {
    let maps = maps(64, 5.0, |_| 1.1 * BACKGROUND, |_| BACKGROUND);
    let mut s = session(&maps, empty_catalog(), InternalModel::new(false, true), fixed_roi(3.0));
    let result = s.calc_background_log_likelihood(true).unwrap();
    let fit = result.fit.as_ref().unwrap();
    assert_eq!(fit.fit.names, vec!["background_norm_bin1".to_string()]);

    let n_pixels = s.calc_bin("1").unwrap().roi_pixels().len() as f64;
    let bn = s.calc_bin("1").unwrap().internal_model_bin().background_norm();
    assert_relative_eq!(bn, 1.1, max_relative = 1e-4);
    // σ(BN) = BN / √(Σn)
    let expected_error = 1.1 / (1.1 * BACKGROUND * n_pixels).sqrt();
    assert_relative_eq!(fit.fit.uncertainties[0], expected_error, max_relative = 0.05);
    assert_relative_eq!(
        s.calc_bin("1").unwrap().internal_model_bin().background_norm_error(),
        expected_error,
        max_relative = 0.05
    );
    let best = poisson_log_likelihood(1.1 * BACKGROUND, 1.1 * BACKGROUND).unwrap() * n_pixels;
    assert_relative_eq!(result.log_likelihood, best, max_relative = 1e-5);
}

#[test]
fn test_expected_excess_is_cached_and_local() {
    let maps = maps(64, 16.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut s = session(&maps, point_catalog(), InternalModel::default(), fixed_roi(15.0));
    let first: Vec<(usize, f64)> = s.expected_excess_maps().unwrap()[0].iter().map(|(p, v)| (p, *v)).collect();
    let second: Vec<(usize, f64)> = s.expected_excess_maps().unwrap()[0].iter().map(|(p, v)| (p, *v)).collect();
    assert_eq!(first, second);

    let hp = Healpix::new(64).unwrap();
    let mut far = 0;
    for (p, v) in &first {
        if hp.pix2pos(*p).angle(&crab()) > 10.5 {
            assert_eq!(*v, 0.0, "pixel {p}");
            far += 1;
        } else {
            assert!(*v >= 0.0);
        }
    }
    assert!(far > 0);
    let total: f64 = first.iter().map(|(_, v)| v).sum();
    assert!(total > 0.0);
}

#[test]
fn test_update_sources_follows_moved_source() {
    let catalog = point_catalog();
    let maps = maps(64, 10.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut s = session(&maps, catalog.clone(), InternalModel::default(), SessionConfig::default());
    assert_eq!(s.roi(), &Roi::disc(&crab(), 5.0));

    catalog.set_point_source_position(0, 85.0, 23.0).unwrap();
    s.calc_log_likelihood_update_sources(false).unwrap();
    let moved = SkyPos::new(85.0, 23.0);
    assert_eq!(s.roi(), &Roi::disc(&moved, 5.0));

    let excess = s.expected_excess_maps().unwrap().remove(0);
    let (peak, _) = excess.iter().fold((0, f64::MIN), |best, (p, v)| if *v > best.1 { (p, *v) } else { best });
    let hp = Healpix::new(64).unwrap();
    assert!(hp.pix2pos(peak).angle(&moved) < 1.0);

    let mut brighter = LogLogSpectrum::default();
    brighter.norm *= 2.0;
    catalog.set_point_source_spectrum(0, brighter).unwrap();
    let before: f64 = excess.iter().map(|(_, v)| v).sum();
    s.update_sources().unwrap();
    let after: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();
    assert_relative_eq!(after, 2.0 * before, max_relative = 1e-9);
}

#[test]
fn test_extended_source_total_and_rescale() {
    let catalog = Arc::new(
        SourceCatalog::new(SourceCatalogSpec {
            point_sources: vec![],
            extended_sources: vec![ExtendedSource {
                name: "disk".into(),
                morphology: Morphology::Disk { ra: CRAB.0, dec: CRAB.1, radius: 1.0 },
                spectrum: LogLogSpectrum::default(),
            }],
        })
        .unwrap(),
    );
    let maps = maps(64, 9.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut config = fixed_roi(8.0);
    config.convolution.grid_step_deg = Some(0.1);
    config.convolution.margin_deg = 3.0;
    let mut s = session(&maps, catalog.clone(), InternalModel::default(), config);

    let total: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();
    // signal of the simulated spectrum in bin 1
    assert_relative_eq!(total, 20.0, max_relative = 0.05);

    let mut brighter = LogLogSpectrum::default();
    brighter.norm *= 3.0;
    catalog.set_extended_source_spectrum(0, brighter).unwrap();
    s.update_sources().unwrap();
    let rescaled: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();
    assert_relative_eq!(rescaled, 3.0 * total, max_relative = 1e-6);

    catalog.set_extended_source_morphology(0, Morphology::Disk { ra: CRAB.0, dec: CRAB.1, radius: 0.5 }).unwrap();
    s.update_sources().unwrap();
    let shrunk: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();
    assert_relative_eq!(shrunk, 60.0, max_relative = 0.05);
}

#[test]
fn test_negative_background_surface_is_clamped() {
    let hp = Healpix::new(64).unwrap();
    let area = hp.pixel_area_deg2();
    // density 2·(dec − 22) + 1 goes negative south of dec 21.5
    let maps = maps(64, 5.0, |_| 10.0, |p| (2.0 * (hp.pix2pos(p).dec() - 22.0) + 1.0) * area);
    let surface = PolynomialSurface::new(1, CRAB.0, CRAB.1).unwrap();
    let model = BackgroundModel::new(Arc::new(surface), vec![0.0; 3], vec![]).unwrap();
    let internal = InternalModel::with_background_model(model, false, false);
    let mut s = session(&maps, empty_catalog(), internal, fixed_roi(3.0));

    let ll = s.calc_background_log_likelihood(false).unwrap().log_likelihood;
    assert!(ll.is_finite());
    let clamped = s.negative_background_count();
    let roi = s.calc_bin("1").unwrap().roi_pixels().clone();
    let south = roi.iter().filter(|&p| hp.pix2pos(p).dec() < 21.4).count();
    assert!(clamped >= south && south > 0, "clamped {clamped}, south {south}");
    assert!(clamped < roi.len());

    s.calc_background_log_likelihood(false).unwrap();
    assert_eq!(s.negative_background_count(), clamped);
}

#[test]
fn test_mismatched_resolutions_rejected() {
    let mut maps = maps(64, 5.0, |_| 10.0, |_| 10.0);
    let hp = Healpix::new(32).unwrap();
    let pixels = hp.query_disc(&crab(), 5.0);
    let coarse = BinMaps::new(SkyMap::new(hp, pixels.clone(), 10.0), SkyMap::new(hp, pixels, 10.0)).unwrap();
    maps.insert("2", coarse).unwrap();
    let bins = BinList::from_names(["1", "2"]).unwrap();
    let err = LikeSession::new(response(), &maps, &bins, point_catalog(), InternalModel::default(), fixed_roi(3.0))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let unknown = BinList::from_names(["1", "7"]).unwrap();
    assert!(
        LikeSession::new(response(), &maps, &unknown, point_catalog(), InternalModel::default(), fixed_roi(3.0))
            .is_err()
    );
}

#[test]
fn test_fixed_common_norm_survives_test_statistic() {
    // on == background: any signal makes the model worse
    let maps = maps(64, 6.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut s = session(&maps, point_catalog(), InternalModel::new(false, false), fixed_roi(3.0));
    let ts = s.calc_test_statistic(true).unwrap();
    assert!(ts.model_fit.is_none());
    assert_eq!(ts.common_norm, 1.0);
    assert_eq!(s.common_norm(), 1.0);
    assert!(ts.ts < 0.0, "TS {}", ts.ts);
    let ll = s.calc_log_likelihood(false).unwrap().log_likelihood;
    assert_relative_eq!(ll, ts.log_likelihood, max_relative = 1e-12);
    assert_relative_eq!(ts.ts, 2.0 * (ll - ts.background_log_likelihood), max_relative = 1e-12);

    // a free background norm still leaves the fixed common norm alone
    let mut s = session(&maps, point_catalog(), InternalModel::new(false, true), fixed_roi(3.0));
    let ts = s.calc_test_statistic(true).unwrap();
    let names = &ts.model_fit.as_ref().unwrap().fit.names;
    assert_eq!(names, &vec!["background_norm_bin1".to_string()]);
    assert_eq!(s.common_norm(), 1.0);
    assert!(ts.ts < 0.0, "TS {}", ts.ts);
    assert!(s.calc_bin("1").unwrap().internal_model_bin().background_norm() < 1.0);
}

#[test]
fn test_spectrum_edit_seen_without_update() {
    let catalog = point_catalog();
    let asimov = asimov_maps(64);
    let mut s = session(&asimov, catalog.clone(), InternalModel::default(), fixed_roi(3.0));
    let before = s.calc_log_likelihood(false).unwrap().log_likelihood;
    let total_before: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();

    let mut brighter = LogLogSpectrum::default();
    brighter.norm *= 10.0;
    catalog.set_point_source_spectrum(0, brighter).unwrap();
    let after = s.calc_log_likelihood(false).unwrap().log_likelihood;
    assert!(after < before, "LL {after} should drop below {before}");
    let total_after: f64 = s.expected_excess_maps().unwrap()[0].iter().map(|(_, v)| v).sum();
    assert_relative_eq!(total_after, 10.0 * total_before, max_relative = 1e-9);

    s.update_sources().unwrap();
    assert_relative_eq!(s.calc_log_likelihood(false).unwrap().log_likelihood, after, max_relative = 1e-12);

    // a moved source drags the automatic ROI along
    let wide = maps(64, 10.0, |_| BACKGROUND, |_| BACKGROUND);
    let mut s = session(&wide, catalog.clone(), InternalModel::default(), SessionConfig::default());
    catalog.set_point_source_position(0, 84.0, 22.5).unwrap();
    s.estimate_norm_and_sigma().unwrap();
    assert_eq!(s.roi(), &Roi::disc(&SkyPos::new(84.0, 22.5), 5.0));
}

/// Source model counting point-source flux reads.
struct CountingModel {
    inner: Arc<SourceCatalog>,
    flux_reads: AtomicUsize,
}

impl CountingModel {
    fn reads(&self) -> usize {
        self.flux_reads.load(Ordering::Relaxed)
    }
}

impl SourceModel for CountingModel {
    fn n_point_sources(&self) -> usize {
        self.inner.n_point_sources()
    }

    fn point_source_name(&self, id: usize) -> Result<String> {
        self.inner.point_source_name(id)
    }

    fn point_source_position(&self, id: usize) -> Result<SkyPos> {
        self.inner.point_source_position(id)
    }

    fn point_source_fluxes(&self, id: usize, energies_mev: &[f64]) -> Result<Vec<f64>> {
        self.flux_reads.fetch_add(1, Ordering::Relaxed);
        self.inner.point_source_fluxes(id, energies_mev)
    }

    fn n_extended_sources(&self) -> usize {
        self.inner.n_extended_sources()
    }

    fn extended_source_name(&self, id: usize) -> Result<String> {
        self.inner.extended_source_name(id)
    }

    fn extended_source_boundaries(&self, id: usize) -> Result<SkyBox> {
        self.inner.extended_source_boundaries(id)
    }

    fn extended_source_fluxes(&self, id: usize, ra: f64, dec: f64, energies_mev: &[f64]) -> Result<Vec<f64>> {
        self.inner.extended_source_fluxes(id, ra, dec, energies_mev)
    }

    fn is_inside_any_extended_source(&self, ra: f64, dec: f64) -> bool {
        self.inner.is_inside_any_extended_source(ra, dec)
    }

    fn versions(&self) -> gf_response::ModelVersions {
        self.inner.versions()
    }
}

/// log10 of the Crab flux relative to its default spectrum.
struct CrabLogScale {
    catalog: Arc<SourceCatalog>,
    block: SharedParameters,
}

impl Tunable for CrabLogScale {
    fn name(&self) -> &str {
        self.block.name()
    }

    fn n_parameters(&self) -> usize {
        1
    }

    fn parameter_name(&self, index: usize) -> Result<String> {
        self.block.parameter_name(index)
    }

    fn parameter(&self, index: usize) -> Result<f64> {
        self.block.parameter(index)
    }

    fn parameter_error(&self, index: usize) -> Result<f64> {
        self.block.parameter_error(index)
    }

    fn set_parameter(&self, index: usize, value: f64) -> Result<()> {
        self.block.set_parameter(index, value)?;
        let mut spectrum = LogLogSpectrum::default();
        spectrum.norm *= 10f64.powf(value);
        self.catalog.set_point_source_spectrum(0, spectrum)
    }

    fn set_parameter_error(&self, index: usize, error: f64) -> Result<()> {
        self.block.set_parameter_error(index, error)
    }

    fn version(&self) -> u64 {
        self.block.version()
    }
}

fn counting_session(
    maps: &SkyMapCollection,
    catalog: Arc<SourceCatalog>,
    common_norm_free: bool,
) -> (LikeSession, Arc<CountingModel>) {
    let model = Arc::new(CountingModel { inner: catalog, flux_reads: AtomicUsize::new(0) });
    let s = session(maps, model.clone(), InternalModel::new(common_norm_free, false), fixed_roi(3.0));
    (s, model)
}

#[test]
fn test_free_parameter_source_refresh_modes() {
    let maps = asimov_maps(64);

    // a parameter the model does not depend on never triggers a re-read
    let (mut s, model) = counting_session(&maps, point_catalog(), true);
    let unrelated = SharedParameters::new("nuisance", &[("unused", 0.5)]);
    s.add_free_parameter(Arc::new(unrelated), 0, false).unwrap();
    s.calc_log_likelihood(false).unwrap();
    let reads = model.reads();
    let result = s.calc_log_likelihood(true).unwrap();
    assert!(result.fit.is_some());
    assert_eq!(model.reads(), reads);

    // a detector-response parameter re-reads the sources at every evaluation
    let (mut s, model) = counting_session(&maps, point_catalog(), true);
    let psf = s.response().psf_tuning().clone();
    s.add_free_parameter(Arc::new(psf), 0, true).unwrap();
    let reads = model.reads();
    let result = s.calc_log_likelihood(true).unwrap();
    let n_fev = result.fit.as_ref().unwrap().fit.n_fev;
    assert!(n_fev > 0);
    assert!(model.reads() - reads >= n_fev, "{} re-reads for {n_fev} evaluations", model.reads() - reads);
    assert!(s.internal_model().is_detector_response_free());

    // a spectral parameter re-reads only when the model changed, and the
    // session stays consistent with the model it leaves behind
    let catalog = point_catalog();
    let (mut s, model) = counting_session(&maps, catalog.clone(), false);
    let scale = CrabLogScale { catalog, block: SharedParameters::new("crab", &[("log_scale", 0.0)]) };
    scale.set_parameter(0, -0.3).unwrap();
    s.add_free_parameter(Arc::new(scale), 0, false).unwrap();
    let reads = model.reads();
    let result = s.calc_log_likelihood(true).unwrap();
    assert!(model.reads() > reads);
    assert!(!s.internal_model().is_detector_response_free());
    let reads = model.reads();
    let again = s.calc_log_likelihood(false).unwrap();
    assert_eq!(model.reads(), reads);
    assert_relative_eq!(again.log_likelihood, result.log_likelihood, max_relative = 1e-12);
}

