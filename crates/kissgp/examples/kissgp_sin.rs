use kissgp::KissGp;
use linfa::prelude::*;
use ndarray::{Array, Axis, concatenate};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use rand_xoshiro::Xoshiro256Plus;

fn main() {
    env_logger::init();

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array::random_using((1000, 1), Uniform::new(0., 1.), &mut rng);
    let noise = Array::random_using(1000, Normal::new(0., 0.2).unwrap(), &mut rng);
    let yt = xt.column(0).mapv(|v: f64| (4. * std::f64::consts::PI * v).sin()) + noise;

    println!("Train KISS-GP on 1000 noisy samples of sin(4 pi x) with a 400 nodes grid");
    let gp = KissGp::params()
        .grid_size(400)
        .grid_bounds(vec![(0., 1.)])
        .n_iterations(30)
        .learning_rate(0.1)
        .seed(Some(42))
        .fit(&Dataset::new(xt, yt))
        .expect("KISS-GP fitting");
    println!("{gp}");
    println!("Loss history: {:?}", gp.losses());

    let xtest = Array::linspace(0., 1., 51).insert_axis(Axis(1));
    let ytrue = xtest.column(0).mapv(|v: f64| (4. * std::f64::consts::PI * v).sin());
    let (lower, upper) = gp
        .confidence_region(&xtest)
        .expect("KISS-GP confidence region");
    let ypred = gp.predict(&xtest).expect("KISS-GP prediction");
    let mae = (&ypred - &ytrue).mapv(f64::abs).mean().unwrap_or(f64::NAN);
    println!("Mean absolute error = {mae}");

    println!("Predictions (x, y, lower, upper)");
    println!(
        "{}",
        concatenate![
            Axis(1),
            xtest,
            ypred.insert_axis(Axis(1)),
            lower.insert_axis(Axis(1)),
            upper.insert_axis(Axis(1))
        ]
    );
}
