mod cg;
mod solver;
