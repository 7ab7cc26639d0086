use criterion::{Criterion, criterion_group, criterion_main};
use kissgp::Hyperparameters;
use kissgp::correlation_models::SquaredExponentialCorr;
use kissgp::grid::Grid;
use kissgp::interpolation::InterpolationWeights;
use kissgp::likelihood::MarginalLikelihood;
use kissgp::mean_models::ConstantMean;
use kissgp::operators::{AddedDiagOperator, InterpolatedOperator, KroneckerToeplitz, LinearOperator};
use kissgp::solver::KrylovSolver;
use ndarray::{Array, array};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use rand_xoshiro::Xoshiro256Plus;

fn criterion_ski(c: &mut Criterion) {
    let nts = [1000, 10000];
    let grid_sizes = [400, 4000];

    let mut group = c.benchmark_group("ski");
    group.sample_size(20);
    for (&nt, &m) in nts.iter().zip(grid_sizes.iter()) {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array::random_using((nt, 1), Uniform::new(0., 1.), &mut rng);
        let yt = xt
            .column(0)
            .mapv(|v: f64| (4. * std::f64::consts::PI * v).sin());
        let grid = Grid::new(&[(0., 1.)], &[m]).expect("grid");
        let weights = InterpolationWeights::new(&grid, &xt).expect("weights");
        let corr = SquaredExponentialCorr();
        let hp = Hyperparameters::new(array![[f64::ln(0.1)]], 1., 0.04, array![0.], 1e-4)
            .expect("hyperparameters");

        let k_grid = KroneckerToeplitz::from_kernel(&corr, &grid, &hp).expect("grid kernel");
        let cov = AddedDiagOperator::new(
            InterpolatedOperator::new(&weights, &k_grid).expect("ski operator"),
            hp.noise_variance(),
        );
        let v = Array::random_using(nt, Uniform::new(-1., 1.), &mut rng);
        group.bench_function(format!("matvec {nt}x{m}"), |b| {
            b.iter(|| std::hint::black_box(cov.matvec(&v.view())))
        });

        let lik = MarginalLikelihood::new(
            ConstantMean(),
            corr,
            xt.view(),
            yt.view(),
            &grid,
            &weights,
            KrylovSolver::default(),
            10,
            30,
        )
        .expect("likelihood");
        group.bench_function(format!("likelihood {nt}x{m}"), |b| {
            b.iter(|| std::hint::black_box(lik.evaluate(&hp, &mut rng).expect("evaluation")))
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_ski);
criterion_main!(benches);
